//! Replicated board document and the bridges that keep it in step with the
//! local store.
//!
//! The replica is a single Yrs map from record id to canonical record JSON.
//! Each value is written whole, so concurrent edits to one record resolve
//! last-writer-wins at record granularity while edits to different records
//! merge.

use thiserror::Error;
use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, Map, MapRef, Observable, Origin, Out, ReadTxn, StateVector, Transact, TransactionMut,
    Update,
};

use crate::origin::SyncOrigin;
use crate::record::{Record, RecordId};

pub mod bridge;
pub mod guard;
pub mod stats;

/// Name of the Y.Map holding every replicated record.
const RECORDS_MAP: &str = "records";

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to observe replica: {0}")]
    Observe(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// One key touched by a replica transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyChange {
    pub id: RecordId,
    pub kind: ChangeKind,
    /// New value for additions and updates. `None` for deletions, and for
    /// values that are not strings.
    pub value: Option<String>,
}

/// Everything a single committed transaction changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaEvent {
    /// `None` when the transaction carried no origin this engine knows.
    pub origin: Option<SyncOrigin>,
    pub changes: Vec<KeyChange>,
}

fn origin_tag(origin: SyncOrigin) -> Origin {
    Origin::from(origin.as_str())
}

fn decode_origin(origin: Option<&Origin>) -> Option<SyncOrigin> {
    let origin = origin?;
    [SyncOrigin::Local, SyncOrigin::Remote, SyncOrigin::Bootstrap]
        .into_iter()
        .find(|candidate| *origin == origin_tag(*candidate))
}

fn out_to_string(value: Out) -> Option<String> {
    value.cast::<String>().ok()
}

/// CRDT copy of the shared part of the board.
///
/// Transactions are serialized by the Yrs document lock. Observers run while
/// a transaction commits, on the committing thread, and must not open another
/// write transaction on the same replica.
pub struct ReplicatedDoc {
    doc: Doc,
    records: MapRef,
}

impl ReplicatedDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        let records = doc.get_or_insert_map(RECORDS_MAP);
        Self { doc, records }
    }

    pub fn get(&self, id: &RecordId) -> Option<String> {
        let txn = self.doc.transact();
        self.records.get(&txn, id.as_str()).and_then(out_to_string)
    }

    /// Decoded record, or `None` if absent or malformed.
    pub fn record(&self, id: &RecordId) -> Option<Record> {
        let json = self.get(id)?;
        Record::from_canonical_json(&json).ok()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        let txn = self.doc.transact();
        self.records.contains_key(&txn, id.as_str())
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.records.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<RecordId> {
        let txn = self.doc.transact();
        let mut ids: Vec<RecordId> = self.records.keys(&txn).map(RecordId::from).collect();
        ids.sort();
        ids
    }

    /// Every `(id, json)` pair, sorted by id. Non-string values are skipped.
    pub fn entries(&self) -> Vec<(RecordId, String)> {
        let txn = self.doc.transact();
        let mut entries: Vec<(RecordId, String)> = self
            .records
            .iter(&txn)
            .filter_map(|(key, value)| out_to_string(value).map(|json| (RecordId::from(key), json)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn set(&self, origin: SyncOrigin, id: &RecordId, value: impl Into<String>) {
        self.transact(origin, |txn| txn.set(id, value));
    }

    pub fn delete(&self, origin: SyncOrigin, id: &RecordId) -> bool {
        self.transact(origin, |txn| txn.delete(id))
    }

    /// Run `f` inside one write transaction tagged with `origin`. Everything
    /// it does commits atomically when `f` returns, and observers see one
    /// event carrying the tag.
    pub fn transact<R>(&self, origin: SyncOrigin, f: impl FnOnce(&mut ReplicaTxn<'_>) -> R) -> R {
        let mut txn = ReplicaTxn {
            txn: self.doc.transact_mut_with(origin_tag(origin)),
            records: &self.records,
        };
        f(&mut txn)
    }

    /// Subscribe to record changes, once per committed transaction.
    pub fn observe<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&ReplicaEvent) + Send + Sync + 'static,
    {
        self.records.observe(move |txn, event| {
            let mut changes: Vec<KeyChange> = event
                .keys(txn)
                .iter()
                .map(|(key, change)| {
                    let id = RecordId::new(key.to_string());
                    match change {
                        EntryChange::Inserted(value) => KeyChange {
                            id,
                            kind: ChangeKind::Added,
                            value: out_to_string(value.clone()),
                        },
                        EntryChange::Updated(_, value) => KeyChange {
                            id,
                            kind: ChangeKind::Updated,
                            value: out_to_string(value.clone()),
                        },
                        EntryChange::Removed(_) => KeyChange {
                            id,
                            kind: ChangeKind::Deleted,
                            value: None,
                        },
                    }
                })
                .collect();

            if changes.is_empty() {
                return;
            }
            changes.sort_by(|a, b| a.id.cmp(&b.id));
            callback(&ReplicaEvent {
                origin: decode_origin(txn.origin()),
                changes,
            });
        })
    }

    /// Subscribe to encoded v1 updates, once per committed transaction.
    pub fn observe_updates<F>(&self, callback: F) -> Result<yrs::Subscription, ReplicaError>
    where
        F: Fn(Option<SyncOrigin>, &[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                callback(decode_origin(txn.origin()), &event.update);
            })
            .map_err(|e| ReplicaError::Observe(format!("{e:?}")))
    }

    pub fn apply_update(&self, update: &[u8], origin: SyncOrigin) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(origin_tag(origin));
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that a peer at `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote =
            StateVector::decode_v1(state_vector).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDoc")
            .field("records", &self.len())
            .finish()
    }
}

/// Open write transaction on a [`ReplicatedDoc`].
pub struct ReplicaTxn<'doc> {
    txn: TransactionMut<'doc>,
    records: &'doc MapRef,
}

impl ReplicaTxn<'_> {
    pub fn get(&self, id: &RecordId) -> Option<String> {
        self.records.get(&self.txn, id.as_str()).and_then(out_to_string)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(&self.txn, id.as_str())
    }

    pub fn set(&mut self, id: &RecordId, value: impl Into<String>) {
        self.records.insert(&mut self.txn, id.as_str(), value.into());
    }

    pub fn delete(&mut self, id: &RecordId) -> bool {
        self.records.remove(&mut self.txn, id.as_str()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sync_pair(a: &ReplicatedDoc, b: &ReplicatedDoc) {
        let to_b = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_update(&to_b, SyncOrigin::Remote).unwrap();
        let to_a = b.encode_diff(&a.state_vector()).unwrap();
        a.apply_update(&to_a, SyncOrigin::Remote).unwrap();
    }

    #[test]
    fn test_set_get_delete() {
        let replica = ReplicatedDoc::new();
        let id = RecordId::from("s1");
        assert!(replica.is_empty());

        replica.set(SyncOrigin::Local, &id, r#"{"id":"s1","kind":"drawable"}"#);
        assert!(replica.contains(&id));
        assert_eq!(replica.len(), 1);
        assert_eq!(replica.record(&id).unwrap().id, id);

        assert!(replica.delete(SyncOrigin::Local, &id));
        assert!(!replica.delete(SyncOrigin::Local, &id));
        assert!(replica.get(&id).is_none());
    }

    #[test]
    fn test_observe_reports_one_event_per_transaction() {
        let replica = ReplicatedDoc::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = replica.observe(move |event| sink.lock().unwrap().push(event.clone()));

        replica.transact(SyncOrigin::Local, |txn| {
            txn.set(&RecordId::from("b"), "1");
            txn.set(&RecordId::from("a"), "2");
        });
        replica.transact(SyncOrigin::Remote, |txn| {
            txn.set(&RecordId::from("a"), "3");
            txn.delete(&RecordId::from("b"));
        });

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].origin, Some(SyncOrigin::Local));
        assert_eq!(events[0].changes.len(), 2);
        assert_eq!(events[0].changes[0].id.as_str(), "a");
        assert_eq!(events[0].changes[0].kind, ChangeKind::Added);

        assert_eq!(events[1].origin, Some(SyncOrigin::Remote));
        assert_eq!(events[1].changes[0].kind, ChangeKind::Updated);
        assert_eq!(events[1].changes[0].value.as_deref(), Some("3"));
        assert_eq!(events[1].changes[1].kind, ChangeKind::Deleted);
        assert_eq!(events[1].changes[1].value, None);
    }

    #[test]
    fn test_applied_updates_carry_their_origin() {
        let source = ReplicatedDoc::new();
        source.set(SyncOrigin::Local, &RecordId::from("s1"), "{}");

        let target = ReplicatedDoc::new();
        let origins = Arc::new(Mutex::new(Vec::new()));
        let sink = origins.clone();
        let _sub = target.observe(move |event| sink.lock().unwrap().push(event.origin));

        target
            .apply_update(&source.encode_state(), SyncOrigin::Remote)
            .unwrap();
        assert_eq!(*origins.lock().unwrap(), vec![Some(SyncOrigin::Remote)]);
    }

    #[test]
    fn test_observe_updates_emits_encoded_bytes() {
        let source = ReplicatedDoc::new();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let _sub = source
            .observe_updates(move |origin, update| {
                sink.lock().unwrap().push((origin, update.to_vec()));
            })
            .unwrap();

        source.set(SyncOrigin::Local, &RecordId::from("s1"), "v1");

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, Some(SyncOrigin::Local));

        let target = ReplicatedDoc::new();
        target.apply_update(&updates[0].1, SyncOrigin::Remote).unwrap();
        assert_eq!(target.get(&RecordId::from("s1")).as_deref(), Some("v1"));
    }

    #[test]
    fn test_disjoint_edits_converge() {
        let a = ReplicatedDoc::new();
        let b = ReplicatedDoc::new();
        a.set(SyncOrigin::Local, &RecordId::from("from-a"), "a");
        b.set(SyncOrigin::Local, &RecordId::from("from-b"), "b");

        sync_pair(&a, &b);
        assert_eq!(a.entries(), b.entries());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_concurrent_writes_to_one_record_pick_one_winner() {
        let a = ReplicatedDoc::new();
        let b = ReplicatedDoc::new();
        let id = RecordId::from("s1");
        a.set(SyncOrigin::Local, &id, "red");
        b.set(SyncOrigin::Local, &id, "blue");

        sync_pair(&a, &b);
        let winner = a.get(&id).unwrap();
        assert_eq!(b.get(&id).unwrap(), winner);
        assert!(winner == "red" || winner == "blue");
    }

    #[test]
    fn test_garbage_update_is_rejected() {
        let replica = ReplicatedDoc::new();
        let err = replica
            .apply_update(&[0xff, 0xff, 0xff], SyncOrigin::Remote)
            .unwrap_err();
        assert!(matches!(err, ReplicaError::Decode(_) | ReplicaError::Apply(_)));
        assert!(replica.encode_diff(&[0xff, 0x01]).is_err());
    }
}
