//! Two-way mirroring between the local store and the replicated document.
//!
//! Local → replicated: every diff tagged `local` is filtered, canonicalized
//! and written into the replica inside one transaction tagged `local`.
//!
//! Replicated → local: every replica transaction not tagged `local` is
//! decoded and merged into the store inside one `merge_scope(remote)`.
//!
//! Both directions run under a [`SyncGuard`] so that the notification caused
//! by one bridge is never mirrored back by the other.

use std::sync::Arc;

use super::guard::SyncGuard;
use super::stats::{SyncStats, SyncStatsSnapshot};
use super::{ChangeKind, ReplicaEvent, ReplicatedDoc};
use crate::filter::is_replicable;
use crate::origin::SyncOrigin;
use crate::record::{Record, RecordId};
use crate::store::{ListenerHandle, LocalStore, StoreDiff};

/// Outcome of one bootstrap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Replica records inserted into the local store.
    pub adopted: usize,
    /// Replica records already present locally and left untouched.
    pub existing: usize,
    /// Replica records with a local-only kind or a mismatched id.
    pub rejected: usize,
    /// Replica values that did not decode.
    pub malformed: usize,
}

/// Keeps the bridge attached. Dropping it detaches both directions.
pub struct BridgeSubscriptions {
    _store_listener: ListenerHandle,
    _replica_observer: yrs::Subscription,
}

impl BridgeSubscriptions {
    pub fn detach(self) {}
}

impl std::fmt::Debug for BridgeSubscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSubscriptions").finish_non_exhaustive()
    }
}

enum Incoming {
    Put(Record),
    Rejected,
    Malformed,
}

pub struct ChangeBridge {
    store: Arc<dyn LocalStore>,
    replica: Arc<ReplicatedDoc>,
    guard: SyncGuard,
    stats: SyncStats,
}

impl ChangeBridge {
    pub fn new(store: Arc<dyn LocalStore>, replica: Arc<ReplicatedDoc>) -> Arc<Self> {
        Arc::new(Self {
            store,
            replica,
            guard: SyncGuard::new(),
            stats: SyncStats::new(),
        })
    }

    /// Subscribe both directions. The callbacks hold the bridge weakly, so
    /// the store and replica never keep it alive.
    pub fn attach(self: &Arc<Self>) -> BridgeSubscriptions {
        let bridge = Arc::downgrade(self);
        let store_listener = self.store.listen(Arc::new(move |diff: &StoreDiff| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.mirror_local(diff);
            }
        }));

        let bridge = Arc::downgrade(self);
        let replica_observer = self.replica.observe(move |event| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.mirror_remote(event);
            }
        });

        BridgeSubscriptions {
            _store_listener: store_listener,
            _replica_observer: replica_observer,
        }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn replica(&self) -> &Arc<ReplicatedDoc> {
        &self.replica
    }

    pub fn guard(&self) -> &SyncGuard {
        &self.guard
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Mirror a local store diff into the replica. Returns how many replica
    /// keys were written or deleted.
    pub fn mirror_local(&self, diff: &StoreDiff) -> usize {
        if diff.origin != SyncOrigin::Local || self.guard.is_active() {
            self.stats.echo_suppressed();
            log::trace!("bridge: not mirroring {} diff of {} records", diff.origin, diff.len());
            return 0;
        }

        let mut writes: Vec<(RecordId, String)> = Vec::new();
        let mut filtered = 0;
        let mut skipped = 0;
        for record in diff.added.iter().chain(diff.updated.iter()) {
            if !is_replicable(record.kind) {
                filtered += 1;
                continue;
            }
            match record.to_canonical_json() {
                Ok(json) => writes.push((record.id.clone(), json)),
                Err(e) => {
                    skipped += 1;
                    log::warn!("bridge: skipping record {}: {}", record.id, e);
                }
            }
        }

        let mut deletes: Vec<RecordId> = Vec::new();
        for record in &diff.removed {
            if is_replicable(record.kind) {
                deletes.push(record.id.clone());
            } else {
                filtered += 1;
            }
        }

        self.stats.filtered(filtered);
        self.stats.skipped(skipped);
        if writes.is_empty() && deletes.is_empty() {
            return 0;
        }

        let _token = self.guard.enter(SyncOrigin::Local);
        let mirrored = self.replica.transact(SyncOrigin::Local, |txn| {
            for (id, json) in &writes {
                txn.set(id, json.as_str());
            }
            for id in &deletes {
                txn.delete(id);
            }
            writes.len() + deletes.len()
        });

        self.stats.mirrored_out(mirrored);
        log::debug!(
            "bridge: mirrored {} local changes ({} filtered, {} skipped)",
            mirrored,
            filtered,
            skipped
        );
        mirrored
    }

    /// Merge a replica event into the local store. Returns how many store
    /// operations were queued.
    pub fn mirror_remote(&self, event: &ReplicaEvent) -> usize {
        if event.origin == Some(SyncOrigin::Local) || self.guard.is_active() {
            self.stats.echo_suppressed();
            return 0;
        }

        let mut puts: Vec<Record> = Vec::new();
        let mut removes: Vec<RecordId> = Vec::new();
        let mut rejected = 0;
        let mut malformed = 0;
        for change in &event.changes {
            match change.kind {
                ChangeKind::Deleted => removes.push(change.id.clone()),
                ChangeKind::Added | ChangeKind::Updated => {
                    match decode_incoming(&change.id, change.value.as_deref()) {
                        Incoming::Put(record) => puts.push(record),
                        Incoming::Rejected => rejected += 1,
                        Incoming::Malformed => malformed += 1,
                    }
                }
            }
        }

        self.stats.rejected(rejected);
        self.stats.malformed(malformed);
        let applied = puts.len() + removes.len();
        if applied == 0 {
            return 0;
        }

        let _token = self.guard.enter(SyncOrigin::Remote);
        self.store.merge_scope(SyncOrigin::Remote, &mut |batch| {
            for record in puts.drain(..) {
                batch.put(record);
            }
            for id in removes.drain(..) {
                batch.remove(id);
            }
        });

        self.stats.mirrored_in(applied);
        log::debug!(
            "bridge: merged {} remote changes ({} rejected, {} malformed)",
            applied,
            rejected,
            malformed
        );
        applied
    }

    /// Adopt every replicable replica record missing from the local store.
    ///
    /// Records already present locally are left as they are, so running this
    /// again after a reconnect changes nothing.
    pub fn bootstrap(&self) -> BootstrapReport {
        let mut report = BootstrapReport::default();
        let mut adopt: Vec<Record> = Vec::new();

        for (id, json) in self.replica.entries() {
            match decode_incoming(&id, Some(&json)) {
                Incoming::Put(record) => {
                    if self.store.contains(&record.id) {
                        report.existing += 1;
                    } else {
                        adopt.push(record);
                    }
                }
                Incoming::Rejected => report.rejected += 1,
                Incoming::Malformed => report.malformed += 1,
            }
        }

        report.adopted = adopt.len();
        if !adopt.is_empty() {
            let _token = self.guard.enter(SyncOrigin::Bootstrap);
            self.store.merge_scope(SyncOrigin::Bootstrap, &mut |batch| {
                for record in adopt.drain(..) {
                    batch.put(record);
                }
            });
        }

        self.stats.rejected(report.rejected);
        self.stats.malformed(report.malformed);
        self.stats.bootstrap_run(report.adopted);
        log::info!(
            "bootstrap: adopted {}, kept {} existing, rejected {}, malformed {}",
            report.adopted,
            report.existing,
            report.rejected,
            report.malformed
        );
        report
    }
}

fn decode_incoming(key: &RecordId, value: Option<&str>) -> Incoming {
    let Some(json) = value else {
        log::warn!("bridge: replica value for {key} is not a string");
        return Incoming::Malformed;
    };
    let record = match Record::from_canonical_json(json) {
        Ok(record) => record,
        Err(e) => {
            log::warn!("bridge: malformed replica value for {key}: {e}");
            return Incoming::Malformed;
        }
    };
    if record.id != *key {
        log::warn!("bridge: replica key {key} holds record {}", record.id);
        return Incoming::Rejected;
    }
    if !is_replicable(record.kind) {
        log::warn!("bridge: replica holds local-only {} record {key}", record.kind);
        return Incoming::Rejected;
    }
    Incoming::Put(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::store::MemoryStore;
    use std::sync::Mutex;

    struct Client {
        store: Arc<MemoryStore>,
        replica: Arc<ReplicatedDoc>,
        bridge: Arc<ChangeBridge>,
        _subs: BridgeSubscriptions,
    }

    fn client_with(store: MemoryStore) -> Client {
        let store = Arc::new(store);
        let replica = Arc::new(ReplicatedDoc::new());
        let bridge = ChangeBridge::new(store.clone(), replica.clone());
        let subs = bridge.attach();
        Client {
            store,
            replica,
            bridge,
            _subs: subs,
        }
    }

    fn client() -> Client {
        client_with(MemoryStore::new())
    }

    fn diff_log(store: &MemoryStore) -> (Arc<Mutex<Vec<StoreDiff>>>, ListenerHandle) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = store.listen(Arc::new(move |diff: &StoreDiff| {
            sink.lock().unwrap().push(diff.clone());
        }));
        (seen, handle)
    }

    // Ship everything `from` has that `to` lacks, as the transport would.
    fn ship(from: &Client, to: &Client) {
        let update = from.replica.encode_diff(&to.replica.state_vector()).unwrap();
        to.replica.apply_update(&update, SyncOrigin::Remote).unwrap();
    }

    #[test]
    fn test_local_put_reaches_replica_without_echo() {
        let c = client();
        let (diffs, _handle) = diff_log(&c.store);

        c.store.put(vec![Record::drawable("s1", 10.0, 20.0).with_prop("color", "red")]);

        let record = c.replica.record(&RecordId::from("s1")).unwrap();
        assert_eq!(record.x, 10.0);
        assert_eq!(diffs.lock().unwrap().len(), 1);

        let stats = c.bridge.stats();
        assert_eq!(stats.records_mirrored_out, 1);
        assert_eq!(stats.records_mirrored_in, 0);
    }

    #[test]
    fn test_local_only_kinds_never_replicate() {
        let c = client();
        c.store.put(vec![
            Record::new("camera:me", RecordKind::Camera),
            Record::new("pointer:me", RecordKind::Pointer),
            Record::new("selection:me", RecordKind::Selection),
            Record::new("instance:me", RecordKind::Instance),
            Record::new("img:1", RecordKind::Attachment),
        ]);

        assert_eq!(c.replica.ids(), vec![RecordId::from("img:1")]);
        assert_eq!(c.bridge.stats().records_filtered, 4);
    }

    #[test]
    fn test_local_delete_removes_from_replica() {
        let c = client();
        c.store.put(vec![Record::drawable("s1", 0.0, 0.0)]);
        c.store.remove(&[RecordId::from("s1")]);
        assert!(c.replica.is_empty());
    }

    #[test]
    fn test_unserializable_record_is_skipped_not_fatal() {
        let c = client();
        c.store.put(vec![
            Record::drawable("bad", f64::NAN, 0.0),
            Record::drawable("good", 1.0, 1.0),
        ]);

        assert_eq!(c.replica.ids(), vec![RecordId::from("good")]);
        assert_eq!(c.bridge.stats().records_skipped, 1);
    }

    #[test]
    fn test_remote_change_is_merged_once_and_not_reshipped() {
        let alice = client();
        let bob = client();
        let (diffs, _handle) = diff_log(&bob.store);

        let local_updates = Arc::new(Mutex::new(0));
        let counter = local_updates.clone();
        let _sub = bob
            .replica
            .observe_updates(move |origin, _| {
                if origin == Some(SyncOrigin::Local) {
                    *counter.lock().unwrap() += 1;
                }
            })
            .unwrap();

        alice.store.put(vec![Record::drawable("s1", 3.0, 4.0)]);
        ship(&alice, &bob);

        let diffs = diffs.lock().unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].origin, SyncOrigin::Remote);
        assert_eq!(bob.store.get(&RecordId::from("s1")).unwrap().x, 3.0);
        assert_eq!(*local_updates.lock().unwrap(), 0);
    }

    #[test]
    fn test_remote_delete_removes_locally() {
        let alice = client();
        let bob = client();
        alice.store.put(vec![Record::drawable("s1", 0.0, 0.0)]);
        ship(&alice, &bob);
        assert!(bob.store.contains(&RecordId::from("s1")));

        alice.store.remove(&[RecordId::from("s1")]);
        ship(&alice, &bob);
        assert!(bob.store.is_empty());
    }

    #[test]
    fn test_nested_write_during_remote_merge_is_not_mirrored() {
        let alice = client();
        let bob = client();

        let store = Arc::downgrade(&bob.store);
        let _reactor = bob.store.listen(Arc::new(move |diff: &StoreDiff| {
            if diff.origin == SyncOrigin::Remote {
                if let Some(store) = store.upgrade() {
                    store.put(vec![Record::drawable("reaction", 0.0, 0.0)]);
                }
            }
        }));

        alice.store.put(vec![Record::drawable("s1", 0.0, 0.0)]);
        ship(&alice, &bob);

        assert!(bob.store.contains(&RecordId::from("reaction")));
        assert!(!bob.replica.contains(&RecordId::from("reaction")));
        assert!(!bob.bridge.guard().is_active());
    }

    #[test]
    fn test_remote_values_are_validated() {
        let c = client();
        c.replica.transact(SyncOrigin::Remote, |txn| {
            txn.set(&RecordId::from("junk"), "not json");
            txn.set(
                &RecordId::from("cam"),
                Record::new("cam", RecordKind::Camera).to_canonical_json().unwrap(),
            );
            txn.set(
                &RecordId::from("alias"),
                Record::drawable("other", 0.0, 0.0).to_canonical_json().unwrap(),
            );
            txn.set(
                &RecordId::from("ok"),
                Record::drawable("ok", 0.0, 0.0).to_canonical_json().unwrap(),
            );
        });

        assert_eq!(c.store.len(), 1);
        assert!(c.store.contains(&RecordId::from("ok")));
        let stats = c.bridge.stats();
        assert_eq!(stats.records_malformed, 1);
        assert_eq!(stats.records_rejected, 2);
    }

    #[test]
    fn test_bootstrap_adopts_missing_and_is_idempotent() {
        let source = client();
        source.store.put(vec![
            Record::drawable("shared", 1.0, 1.0),
            Record::drawable("local-copy", 2.0, 2.0),
        ]);

        let target = client_with(MemoryStore::with_records([Record::drawable(
            "local-copy",
            9.0,
            9.0,
        )]));
        // Detach first so the plain update does not merge through the bridge.
        let Client {
            store,
            replica,
            bridge,
            _subs,
        } = target;
        drop(_subs);
        let update = source.replica.encode_state();
        replica.apply_update(&update, SyncOrigin::Remote).unwrap();
        let (diffs, _handle) = diff_log(&store);

        let first = bridge.bootstrap();
        assert_eq!(
            first,
            BootstrapReport {
                adopted: 1,
                existing: 1,
                rejected: 0,
                malformed: 0,
            }
        );
        assert_eq!(store.get(&RecordId::from("local-copy")).unwrap().x, 9.0);
        assert_eq!(diffs.lock().unwrap()[0].origin, SyncOrigin::Bootstrap);

        let second = bridge.bootstrap();
        assert_eq!(second.adopted, 0);
        assert_eq!(second.existing, 2);
        assert_eq!(store.len(), 2);
        assert_eq!(diffs.lock().unwrap().len(), 1);

        let stats = bridge.stats();
        assert_eq!(stats.bootstrap_runs, 2);
        assert_eq!(stats.bootstrap_adopted, 1);
    }

    #[test]
    fn test_bootstrap_does_not_reach_replica() {
        let c = client();
        c.replica.set(
            SyncOrigin::Remote,
            &RecordId::from("s1"),
            Record::drawable("s1", 0.0, 0.0).to_canonical_json().unwrap(),
        );
        assert!(c.store.contains(&RecordId::from("s1")));
        let before = c.replica.state_vector();

        let report = c.bridge.bootstrap();
        assert_eq!(report.existing, 1);
        assert_eq!(c.replica.state_vector(), before);
    }

    #[test]
    fn test_two_clients_converge_on_disjoint_edits() {
        let alice = client();
        let bob = client();
        alice.store.put(vec![Record::drawable("a1", 0.0, 0.0)]);
        bob.store.put(vec![Record::drawable("b1", 5.0, 5.0)]);

        ship(&alice, &bob);
        ship(&bob, &alice);

        assert_eq!(alice.replica.entries(), bob.replica.entries());
        let mut ids: Vec<RecordId> = alice.store.records().into_iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec![RecordId::from("a1"), RecordId::from("b1")]);
        assert_eq!(alice.store.records(), bob.store.records());
    }

    #[test]
    fn test_arrow_after_shape_is_never_dangling() {
        let alice = client();
        let bob = client();

        alice.store.put(vec![Record::drawable("shape:1", 0.0, 0.0)]);
        ship(&alice, &bob);

        let arrow = Record::new("relation:1", RecordKind::Relation).with_prop("to", "shape:1");
        bob.store.put(vec![arrow]);
        ship(&bob, &alice);

        let seen = alice.store.get(&RecordId::from("relation:1")).unwrap();
        let target = seen.prop("to").and_then(|v| v.as_str()).unwrap();
        assert!(alice.store.contains(&RecordId::from(target)));
    }

    #[test]
    fn test_detached_bridge_stops_mirroring() {
        let c = client();
        let Client {
            store,
            replica,
            _subs,
            ..
        } = c;
        _subs.detach();

        store.put(vec![Record::drawable("s1", 0.0, 0.0)]);
        assert!(replica.is_empty());
        assert_eq!(store.listener_count(), 0);
    }
}
