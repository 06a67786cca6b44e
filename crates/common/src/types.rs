//! Common data types for rendezvous bus components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Unique identifier for an established session.
///
/// Id `0` is never handed out for a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local rendezvous point targeted by join requests.
pub type SessionPort = u16;

/// Binding this port asks the registry to allocate a free one.
pub const SESSION_PORT_ANY: SessionPort = 0;

/// Set of transports a name is advertised over or a session may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransportMask(pub u16);

impl TransportMask {
    /// No transports.
    pub const NONE: Self = Self(0x0000);
    /// Local (same-host) transport.
    pub const LOCAL: Self = Self(0x0001);
    /// TCP transport.
    pub const TCP: Self = Self(0x0004);
    /// UDP transport.
    pub const UDP: Self = Self(0x0100);
    /// Experimental transports, excluded from `ANY`.
    pub const EXPERIMENTAL: Self = Self(0x8000);
    /// Every IP-based transport.
    pub const IP: Self = Self(0x0004 | 0x0100);
    /// Every non-experimental transport.
    pub const ANY: Self = Self(0xFFFF & !0x8000);

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when the two masks share at least one transport.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Bits of `self` not present in `other`.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for TransportMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TransportMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TransportMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for TransportMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Display for TransportMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Kinds of traffic a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficType(pub u8);

impl TrafficType {
    /// Bus messages.
    pub const MESSAGES: Self = Self(0x01);
    /// Raw unreliable byte stream.
    pub const RAW_UNRELIABLE: Self = Self(0x02);
    /// Raw reliable byte stream.
    pub const RAW_RELIABLE: Self = Self(0x04);

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for TrafficType {
    fn default() -> Self {
        Self::MESSAGES
    }
}

/// Physical or network proximity constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proximity(pub u8);

impl Proximity {
    /// Physically close peers only.
    pub const PHYSICAL: Self = Self(0x01);
    /// Peers on the same network.
    pub const NETWORK: Self = Self(0x02);
    /// No constraint.
    pub const ANY: Self = Self(0xFF);

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for Proximity {
    fn default() -> Self {
        Self::ANY
    }
}

/// Session options exchanged during negotiation.
///
/// Immutable once constructed; the builder-style methods return new values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOpts {
    /// Traffic carried by the session.
    pub traffic: TrafficType,
    /// Whether more than two parties may be members.
    pub is_multipoint: bool,
    /// Proximity constraint.
    pub proximity: Proximity,
    /// Transports the session may run over.
    pub transports: TransportMask,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            traffic: TrafficType::MESSAGES,
            is_multipoint: false,
            proximity: Proximity::ANY,
            transports: TransportMask::ANY,
        }
    }
}

impl SessionOpts {
    /// Message-based options over any transport.
    #[must_use]
    pub fn new(is_multipoint: bool) -> Self {
        Self {
            is_multipoint,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_transports(mut self, transports: TransportMask) -> Self {
        self.transports = transports;
        self
    }

    #[must_use]
    pub const fn with_traffic(mut self, traffic: TrafficType) -> Self {
        self.traffic = traffic;
        self
    }

    #[must_use]
    pub const fn with_proximity(mut self, proximity: Proximity) -> Self {
        self.proximity = proximity;
        self
    }

    /// Whether a joiner offering `self` can join a host offering `host`.
    ///
    /// Transports, traffic and proximity must each overlap. Multipoint is
    /// decided by the host and does not affect compatibility.
    #[must_use]
    pub const fn is_compatible(&self, host: &SessionOpts) -> bool {
        self.transports.intersects(host.transports)
            && self.traffic.intersects(host.traffic)
            && self.proximity.intersects(host.proximity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mask_constants() {
        assert_eq!(TransportMask::IP.bits(), 0x0104);
        assert_eq!(TransportMask::ANY.bits(), 0x7FFF);
        assert!(TransportMask::ANY.contains(TransportMask::TCP));
        assert!(!TransportMask::ANY.contains(TransportMask::EXPERIMENTAL));
    }

    #[test]
    fn test_transport_mask_ops() {
        let mut mask = TransportMask::TCP;
        mask |= TransportMask::LOCAL;
        assert!(mask.contains(TransportMask::LOCAL));
        assert_eq!(mask.without(TransportMask::TCP), TransportMask::LOCAL);
        assert!(mask.without(mask).is_empty());
        assert_eq!((mask & TransportMask::IP), TransportMask::TCP);
        assert_eq!(TransportMask::UDP.to_string(), "0x0100");
    }

    #[test]
    fn test_session_opts_compatibility() {
        let host = SessionOpts::new(true).with_transports(TransportMask::TCP);
        let joiner = SessionOpts::new(false).with_transports(TransportMask::IP);
        assert!(joiner.is_compatible(&host), "multipoint mismatch is allowed");

        let udp_only = SessionOpts::new(true).with_transports(TransportMask::UDP);
        assert!(!udp_only.is_compatible(&host));

        let raw = SessionOpts::new(true).with_traffic(TrafficType::RAW_RELIABLE);
        assert!(!raw.is_compatible(&SessionOpts::new(true)));

        let physical = SessionOpts::new(true).with_proximity(Proximity::PHYSICAL);
        let network_host = SessionOpts::new(true).with_proximity(Proximity::NETWORK);
        assert!(!physical.is_compatible(&network_host));
        assert!(physical.is_compatible(&SessionOpts::default()));
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId(42).to_string(), "42");
        assert_eq!(SessionId(7).get(), 7);
    }
}
