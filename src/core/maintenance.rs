//! Periodic upkeep: bucket refresh, stale contact purging, liveness
//! probes, value expiry and republishing.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::common::{Id, RoutingTable};
use crate::core::config::Config;
use crate::core::storage::ContentStore;

/// How often the actor scans for due maintenance work. Individual tasks
/// have their own (longer) intervals; this only bounds scan frequency.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Maintenance {
    last_sweep: Instant,
    sweep_interval: Duration,
}

/// Everything one sweep decided needs doing. The actor turns these into
/// queries and messages; this module never touches the network.
#[derive(Debug, Default)]
pub struct Decisions {
    /// Lookup targets for buckets with no recent successful exchange.
    pub refresh_targets: Vec<Id>,
    /// Contacts past the failure threshold, to be removed.
    pub purge: Vec<Id>,
    /// Quiet but not yet suspect contacts, to be pinged.
    pub ping: Vec<(Id, SocketAddrV4)>,
    /// Stored values past their time-to-live, to be dropped.
    pub expired_keys: Vec<Id>,
    /// Own values due to be pushed to the closest nodes again.
    pub republish: Vec<(Id, Bytes)>,
}

impl Decisions {
    pub fn is_empty(&self) -> bool {
        self.refresh_targets.is_empty()
            && self.purge.is_empty()
            && self.ping.is_empty()
            && self.expired_keys.is_empty()
            && self.republish.is_empty()
    }
}

impl Maintenance {
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            last_sweep: Instant::now(),
            sweep_interval,
        }
    }

    /// Run a sweep if one is due, collecting all currently due work.
    pub fn tick(
        &mut self,
        now: Instant,
        config: &Config,
        local_id: &Id,
        routing_table: &RoutingTable,
        store: &ContentStore,
    ) -> Option<Decisions> {
        if now.duration_since(self.last_sweep) < self.sweep_interval {
            return None;
        }
        self.last_sweep = now;

        Some(Decisions {
            refresh_targets: routing_table.refresh_targets(config.bucket_refresh_interval, now),
            purge: routing_table.stale_nodes(),
            ping: routing_table.nodes_to_ping(config.bucket_refresh_interval, now),
            expired_keys: store.expired_keys(now),
            republish: store.republish_due(local_id, config.republish_interval, now),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::Node;

    #[test]
    fn sweep_respects_its_interval() {
        let mut maintenance = Maintenance::new(Duration::from_secs(60));
        let config = Config::default();
        let local_id = Id::random();
        let table = RoutingTable::new(local_id);
        let store = ContentStore::new(10, config.content_ttl);

        let now = Instant::now();
        assert!(maintenance
            .tick(now, &config, &local_id, &table, &store)
            .is_none());

        let later = now + Duration::from_secs(61);
        assert!(maintenance
            .tick(later, &config, &local_id, &table, &store)
            .is_some());

        // A sweep just ran, the next one is not due yet.
        assert!(maintenance
            .tick(later, &config, &local_id, &table, &store)
            .is_none());
    }

    #[test]
    fn sweep_collects_due_work() {
        let mut maintenance = Maintenance::new(Duration::from_secs(60));
        let config = Config::default();
        let local_id = Id::random();

        let mut table = RoutingTable::new(local_id).with_stale_threshold(1);
        let failed = Node::random();
        table.insert_or_touch(failed.clone());
        table.mark_stale(failed.id());

        let mut store = ContentStore::new(10, config.content_ttl);
        let now = Instant::now();

        let own_value = Bytes::from_static(b"own");
        let own_key = Id::hash(&own_value);
        store.put_at(own_key, own_value.clone(), local_id, now);

        let later = now + config.republish_interval;
        let decisions = maintenance
            .tick(later, &config, &local_id, &table, &store)
            .expect("sweep due");

        assert_eq!(decisions.purge, vec![*failed.id()]);
        assert_eq!(decisions.republish, vec![(own_key, own_value)]);
        // The failed contact is not a ping candidate.
        assert!(decisions.ping.is_empty());
        assert!(!decisions.refresh_targets.is_empty());
    }
}
