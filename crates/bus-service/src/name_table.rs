//! `NameTable` - advertised name to transport/owner records.
//!
//! The table is split into lock shards keyed by a hash of the name. All
//! updates to one name go through the same shard lock, and the matching
//! event is enqueued while that lock is held, so events for one name reach
//! the dispatcher in exactly the order the updates were applied. Updates to
//! names in different shards proceed in parallel.
//!
//! A name advertised over several transports keeps one record whose mask
//! shrinks per transport on loss; the record disappears when the mask
//! becomes empty.

use crate::actors::messages::BusEvent;
use crate::actors::{EngineMetrics, EventDispatcher};
use crate::errors::BusError;

use common::names::{validate_bus_name, validate_name_prefix, validate_well_known_name};
use common::types::TransportMask;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// One advertised name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvertisedName {
    pub name: String,
    /// Transports the name is currently advertised over.
    pub transports: TransportMask,
    /// Prefix of the most recent discovery.
    pub prefix: String,
    /// Unique name of the current owner, if known.
    pub owner: Option<String>,
}

type Shard = Mutex<HashMap<String, AdvertisedName>>;

/// Sharded advertised-name table.
pub struct NameTable {
    shards: Vec<Shard>,
    dispatcher: EventDispatcher,
    metrics: Arc<EngineMetrics>,
}

impl NameTable {
    /// Create a table with `shard_count` shards (at least one).
    #[must_use]
    pub fn new(
        shard_count: usize,
        dispatcher: EventDispatcher,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shards,
            dispatcher,
            metrics,
        }
    }

    fn shard(&self, name: &str) -> Result<&Shard, BusError> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        // Shard count fits in usize, so the remainder does too
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        self.shards
            .get(index)
            .ok_or_else(|| BusError::Internal(format!("name table shard {index} missing")))
    }

    /// Record that `name` was found over `transport`.
    pub fn record_found(
        &self,
        name: &str,
        transport: TransportMask,
        prefix: &str,
    ) -> Result<(), BusError> {
        validate_well_known_name(name)?;
        validate_name_prefix(prefix)?;

        let mut shard = self.shard(name)?.lock();
        match shard.get_mut(name) {
            Some(entry) => {
                entry.transports |= transport;
                entry.prefix = prefix.to_string();
            }
            None => {
                shard.insert(
                    name.to_string(),
                    AdvertisedName {
                        name: name.to_string(),
                        transports: transport,
                        prefix: prefix.to_string(),
                        owner: None,
                    },
                );
                self.metrics.name_added();
            }
        }
        trace!(
            target: "bus.names",
            name,
            transport = %transport,
            "Advertised name found"
        );
        self.dispatcher.enqueue(BusEvent::FoundAdvertisedName {
            name: name.to_string(),
            transport,
            prefix: prefix.to_string(),
        });
        Ok(())
    }

    /// Record that `name` is no longer advertised over `transport`.
    ///
    /// Unknown names and transports leave the table unchanged; the loss is
    /// still forwarded to listeners.
    pub fn record_lost(
        &self,
        name: &str,
        transport: TransportMask,
        prefix: &str,
    ) -> Result<(), BusError> {
        validate_well_known_name(name)?;
        validate_name_prefix(prefix)?;

        let mut shard = self.shard(name)?.lock();
        let emptied = match shard.get_mut(name) {
            Some(entry) => {
                entry.transports = entry.transports.without(transport);
                entry.transports.is_empty()
            }
            None => false,
        };
        if emptied {
            shard.remove(name);
            self.metrics.name_removed();
            debug!(target: "bus.names", name, "Advertised name removed");
        }
        self.dispatcher.enqueue(BusEvent::LostAdvertisedName {
            name: name.to_string(),
            transport,
            prefix: prefix.to_string(),
        });
        Ok(())
    }

    /// Record an ownership change for `name`.
    ///
    /// Only updates the owner of names already in the table; the event is
    /// forwarded either way.
    pub fn owner_changed(
        &self,
        name: &str,
        previous_owner: Option<&str>,
        new_owner: Option<&str>,
    ) -> Result<(), BusError> {
        validate_bus_name(name)?;
        for owner in previous_owner.iter().chain(new_owner.iter()) {
            validate_bus_name(owner)?;
        }

        let mut shard = self.shard(name)?.lock();
        if let Some(entry) = shard.get_mut(name) {
            entry.owner = new_owner.map(str::to_string);
        }
        self.dispatcher.enqueue(BusEvent::NameOwnerChanged {
            name: name.to_string(),
            previous_owner: previous_owner.map(str::to_string),
            new_owner: new_owner.map(str::to_string),
        });
        Ok(())
    }

    /// Drop every name owned by `owner`, emitting one loss per name.
    ///
    /// Returns the names removed, sorted.
    pub fn owner_disconnected(&self, owner: &str) -> Vec<String> {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            let owned: Vec<String> = shard
                .values()
                .filter(|entry| entry.owner.as_deref() == Some(owner))
                .map(|entry| entry.name.clone())
                .collect();
            for name in owned {
                if let Some(entry) = shard.remove(&name) {
                    self.metrics.name_removed();
                    self.dispatcher.enqueue(BusEvent::LostAdvertisedName {
                        name: entry.name.clone(),
                        transport: entry.transports,
                        prefix: entry.prefix,
                    });
                    removed.push(entry.name);
                }
            }
        }
        if !removed.is_empty() {
            debug!(
                target: "bus.names",
                owner,
                count = removed.len(),
                "Names dropped after owner disconnect"
            );
        }
        removed.sort();
        removed
    }

    /// Transports `name` is advertised over; empty if unknown.
    #[must_use]
    pub fn lookup(&self, name: &str) -> TransportMask {
        self.entry(name)
            .map_or(TransportMask::NONE, |entry| entry.transports)
    }

    /// Full record for `name`.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<AdvertisedName> {
        self.shard(name).ok()?.lock().get(name).cloned()
    }

    /// All known names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().keys().cloned().collect::<Vec<_>>())
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::Subscriber;
    use crate::listeners::BusListener;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl BusListener for Log {
        async fn found_advertised_name(&self, name: &str, t: TransportMask, _p: &str) {
            self.0.lock().push(format!("found {name} {t}"));
        }

        async fn lost_advertised_name(&self, name: &str, t: TransportMask, _p: &str) {
            self.0.lock().push(format!("lost {name} {t}"));
        }

        async fn name_owner_changed(&self, name: &str, _prev: Option<&str>, new: Option<&str>) {
            self.0
                .lock()
                .push(format!("owner {name} {}", new.unwrap_or("-")));
        }
    }

    fn table() -> (NameTable, EventDispatcher, Arc<Log>) {
        let metrics = EngineMetrics::new();
        let (dispatcher, _task) =
            EventDispatcher::spawn(CancellationToken::new(), Arc::clone(&metrics));
        let log = Arc::new(Log::default());
        dispatcher.register(Subscriber::Bus(log.clone())).unwrap();
        (NameTable::new(4, dispatcher.clone(), metrics), dispatcher, log)
    }

    #[tokio::test]
    async fn test_found_then_lost_same_transport() {
        let (table, dispatcher, log) = table();

        table
            .record_found("org.example.Foo", TransportMask::TCP, "org.example")
            .unwrap();
        assert_eq!(table.lookup("org.example.Foo"), TransportMask::TCP);

        table
            .record_lost("org.example.Foo", TransportMask::TCP, "org.example")
            .unwrap();
        assert!(table.lookup("org.example.Foo").is_empty());
        assert!(table.is_empty());

        dispatcher.flush().await.unwrap();
        assert_eq!(
            *log.0.lock(),
            vec!["found org.example.Foo 0x0004", "lost org.example.Foo 0x0004"]
        );
    }

    #[tokio::test]
    async fn test_removal_is_per_transport() {
        let (table, _dispatcher, _log) = table();

        table
            .record_found("org.example.Foo", TransportMask::TCP, "org")
            .unwrap();
        table
            .record_found("org.example.Foo", TransportMask::UDP, "org")
            .unwrap();
        assert_eq!(table.lookup("org.example.Foo"), TransportMask::IP);

        table
            .record_lost("org.example.Foo", TransportMask::TCP, "org")
            .unwrap();
        assert_eq!(table.lookup("org.example.Foo"), TransportMask::UDP);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_without_event() {
        let (table, dispatcher, log) = table();

        let result = table.record_found("not_dotted", TransportMask::TCP, "");
        assert!(matches!(result, Err(BusError::InvalidName(_))));
        let result = table.record_lost("org.9bad", TransportMask::TCP, "");
        assert!(matches!(result, Err(BusError::InvalidName(_))));
        let too_long = format!("org.{}", "x".repeat(300));
        assert!(table.record_found(&too_long, TransportMask::TCP, "").is_err());

        dispatcher.flush().await.unwrap();
        assert!(table.is_empty());
        assert!(log.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_lost_unknown_name_still_notifies() {
        let (table, dispatcher, log) = table();

        table
            .record_lost("org.never.Seen", TransportMask::TCP, "org")
            .unwrap();
        dispatcher.flush().await.unwrap();

        assert!(table.is_empty());
        assert_eq!(*log.0.lock(), vec!["lost org.never.Seen 0x0004"]);
    }

    #[tokio::test]
    async fn test_owner_changed_and_disconnect() {
        let (table, dispatcher, log) = table();

        table.record_found("org.a.One", TransportMask::TCP, "org").unwrap();
        table.record_found("org.a.Two", TransportMask::LOCAL, "org").unwrap();
        table.owner_changed("org.a.One", None, Some(":1.5")).unwrap();
        table.owner_changed("org.a.Two", None, Some(":1.5")).unwrap();
        assert_eq!(
            table.entry("org.a.One").unwrap().owner.as_deref(),
            Some(":1.5")
        );

        assert!(table.owner_changed("org.a.One", Some("bad"), None).is_err());

        let removed = table.owner_disconnected(":1.5");
        assert_eq!(removed, vec!["org.a.One", "org.a.Two"]);
        assert!(table.is_empty());

        dispatcher.flush().await.unwrap();
        let events = log.0.lock().clone();
        assert_eq!(events.len(), 6);
        assert!(events.contains(&"lost org.a.Two 0x0001".to_string()));
    }

    #[tokio::test]
    async fn test_per_name_order_under_concurrency() {
        let (table, dispatcher, log) = table();
        let table = Arc::new(table);

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                let name = format!("org.worker.N{worker}");
                for _ in 0..25 {
                    table.record_found(&name, TransportMask::TCP, "org").unwrap();
                    table.record_lost(&name, TransportMask::TCP, "org").unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        dispatcher.flush().await.unwrap();

        let events = log.0.lock().clone();
        assert_eq!(events.len(), 200);
        for worker in 0..4 {
            let name = format!("org.worker.N{worker}");
            let per_name: Vec<_> = events
                .iter()
                .filter(|e| e.contains(&name))
                .map(|e| e.starts_with("found"))
                .collect();
            assert_eq!(per_name.len(), 50);
            // found/lost strictly alternate for each name
            for (i, is_found) in per_name.iter().enumerate() {
                assert_eq!(*is_found, i % 2 == 0);
            }
        }
        assert!(table.is_empty());
    }
}
