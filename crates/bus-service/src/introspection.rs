//! Interface descriptions and their introspection XML.
//!
//! Rendering rules callers depend on:
//! - members sorted by name, two spaces of indentation per level, every
//!   line newline-terminated
//! - signal arguments always render `direction="out"`, whatever direction
//!   they were declared with
//! - method arguments with no declared direction render as `in`

use crate::errors::BusError;

use common::names::{
    validate_bus_name, validate_interface_name, validate_member_name, validate_object_path,
};
use common::signature::split_signature;
use common::types::SessionId;
use std::collections::BTreeMap;
use std::fmt;

/// Standard introspection interface.
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Method,
    Signal,
}

impl MemberKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MemberKind::Method => "method",
            MemberKind::Signal => "signal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgDirection {
    In,
    Out,
}

impl ArgDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ArgDirection::In => "in",
            ArgDirection::Out => "out",
        }
    }
}

/// One member argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: Option<String>,
    /// A single complete type.
    pub signature: String,
    /// Direction as declared; `None` when the declaration gave none.
    pub direction: Option<ArgDirection>,
}

impl Arg {
    #[must_use]
    pub fn new(name: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            signature: signature.into(),
            direction: None,
        }
    }

    #[must_use]
    pub fn with_direction(mut self, direction: ArgDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Direction written to XML for an argument of a `kind` member.
    #[must_use]
    pub fn rendered_direction(&self, kind: MemberKind) -> ArgDirection {
        match kind {
            MemberKind::Signal => ArgDirection::Out,
            MemberKind::Method => self.direction.unwrap_or(ArgDirection::In),
        }
    }
}

/// A method or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub kind: MemberKind,
    pub name: String,
    pub args: Vec<Arg>,
}

impl Member {
    /// Concatenated signature of the arguments rendered with `direction`.
    #[must_use]
    pub fn signature(&self, direction: ArgDirection) -> String {
        self.args
            .iter()
            .filter(|arg| arg.rendered_direction(self.kind) == direction)
            .map(|arg| arg.signature.as_str())
            .collect()
    }
}

/// Description of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescription {
    name: String,
    members: BTreeMap<String, Member>,
}

impl InterfaceDescription {
    pub fn new(name: impl Into<String>) -> Result<Self, BusError> {
        let name = name.into();
        validate_interface_name(&name)?;
        Ok(Self {
            name,
            members: BTreeMap::new(),
        })
    }

    /// The standard `org.freedesktop.DBus.Introspectable` interface.
    #[must_use]
    pub fn introspectable() -> Self {
        let introspect = Member {
            kind: MemberKind::Method,
            name: "Introspect".to_string(),
            args: vec![Arg::new("data", "s").with_direction(ArgDirection::Out)],
        };
        Self {
            name: INTROSPECTABLE_INTERFACE.to_string(),
            members: BTreeMap::from([(introspect.name.clone(), introspect)]),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member from input/output signatures.
    ///
    /// `arg_names` is a comma-separated list applied in order to the input
    /// types and then the output types; missing names leave the argument
    /// unnamed. Input arguments of a method are declared `in` and output
    /// arguments `out`; signal arguments carry no declared direction.
    pub fn add_member(
        &mut self,
        kind: MemberKind,
        name: &str,
        in_sig: &str,
        out_sig: &str,
        arg_names: &str,
    ) -> Result<(), BusError> {
        let inputs = split_signature(in_sig)?;
        let outputs = split_signature(out_sig)?;
        let mut names = arg_names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty());

        let declared = |direction: ArgDirection| match kind {
            MemberKind::Method => Some(direction),
            MemberKind::Signal => None,
        };

        let mut args = Vec::with_capacity(inputs.len() + outputs.len());
        for (types, direction) in [(inputs, ArgDirection::In), (outputs, ArgDirection::Out)] {
            for signature in types {
                args.push(Arg {
                    name: names.next().map(str::to_string),
                    signature: signature.to_string(),
                    direction: declared(direction),
                });
            }
        }
        self.add_member_args(kind, name, args)
    }

    /// Add a member with explicitly built arguments.
    pub fn add_member_args(
        &mut self,
        kind: MemberKind,
        name: &str,
        args: Vec<Arg>,
    ) -> Result<(), BusError> {
        validate_member_name(name)?;
        for arg in &args {
            if split_signature(&arg.signature)?.len() != 1 {
                return Err(BusError::InvalidSignature(format!(
                    "argument of {name} must be one complete type: {}",
                    arg.signature
                )));
            }
        }
        if self.members.contains_key(name) {
            return Err(BusError::Conflict(format!(
                "member {name} already exists on {}",
                self.name
            )));
        }
        self.members.insert(
            name.to_string(),
            Member {
                kind,
                name: name.to_string(),
                args,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn get_member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Members in name order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Introspection XML for this interface.
    #[must_use]
    pub fn introspect(&self) -> String {
        self.to_string()
    }

    fn write_xml(&self, out: &mut impl fmt::Write, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        writeln!(out, "{pad}<interface name=\"{}\">", self.name)?;
        for member in self.members.values() {
            let tag = member.kind.as_str();
            writeln!(out, "{pad}  <{tag} name=\"{}\">", member.name)?;
            for arg in &member.args {
                write!(out, "{pad}    <arg ")?;
                if let Some(name) = &arg.name {
                    write!(out, "name=\"{name}\" ")?;
                }
                writeln!(
                    out,
                    "type=\"{}\" direction=\"{}\"/>",
                    arg.signature,
                    arg.rendered_direction(member.kind).as_str()
                )?;
            }
            writeln!(out, "{pad}  </{tag}>")?;
        }
        writeln!(out, "{pad}</interface>")
    }
}

impl fmt::Display for InterfaceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_xml(f, 0)
    }
}

/// Local view of a remote object: where it lives and what it implements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBusObject {
    service_name: String,
    path: String,
    session_id: SessionId,
    interfaces: BTreeMap<String, InterfaceDescription>,
}

impl ProxyBusObject {
    pub fn new(
        service_name: impl Into<String>,
        path: impl Into<String>,
        session_id: SessionId,
    ) -> Result<Self, BusError> {
        let service_name = service_name.into();
        let path = path.into();
        validate_bus_name(&service_name)?;
        validate_object_path(&path)?;
        Ok(Self {
            service_name,
            path,
            session_id,
            interfaces: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Add `interface`; adding a second interface with the same name is a `Conflict`.
    pub fn add_interface(&mut self, interface: InterfaceDescription) -> Result<(), BusError> {
        if self.interfaces.contains_key(interface.name()) {
            return Err(BusError::Conflict(format!(
                "{} already implements {}",
                self.path,
                interface.name()
            )));
        }
        self.interfaces
            .insert(interface.name().to_string(), interface);
        Ok(())
    }

    #[must_use]
    pub fn get_interface(&self, name: &str) -> Option<&InterfaceDescription> {
        self.interfaces.get(name)
    }

    #[must_use]
    pub fn implements_interface(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    /// Interface names in order.
    #[must_use]
    pub fn interfaces(&self) -> Vec<&str> {
        self.interfaces.keys().map(String::as_str).collect()
    }

    /// Introspection XML for the whole object.
    #[must_use]
    pub fn introspect(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProxyBusObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<node name=\"{}\">", self.path)?;
        for interface in self.interfaces.values() {
            interface.write_xml(f, 1)?;
        }
        writeln!(f, "</node>")
    }
}
