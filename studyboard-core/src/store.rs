//! Local document store: the records this client renders.
//!
//! The canvas layer owns the real store; the sync engine only needs the
//! narrow [`LocalStore`] contract. [`MemoryStore`] implements it for headless
//! clients, tests and benches.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::origin::SyncOrigin;
use crate::record::{Record, RecordId};

/// One batch of changes as observed by store listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreDiff {
    pub origin: SyncOrigin,
    pub added: Vec<Record>,
    pub updated: Vec<Record>,
    /// Records as they were just before removal.
    pub removed: Vec<Record>,
}

impl StoreDiff {
    pub fn new(origin: SyncOrigin) -> Self {
        Self {
            origin,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

pub type StoreListener = Arc<dyn Fn(&StoreDiff) + Send + Sync>;

/// Mutations collected inside [`LocalStore::merge_scope`].
#[derive(Debug, Default)]
pub struct MergeBatch {
    puts: Vec<Record>,
    removes: Vec<RecordId>,
}

impl MergeBatch {
    pub fn put(&mut self, record: Record) {
        self.puts.push(record);
    }

    pub fn remove(&mut self, id: RecordId) {
        self.removes.push(id);
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.removes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.puts.len() + self.removes.len()
    }

    pub fn into_parts(self) -> (Vec<Record>, Vec<RecordId>) {
        (self.puts, self.removes)
    }
}

/// Unsubscribes its listener when dropped.
pub struct ListenerHandle {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Contract the sync engine needs from the canvas document.
///
/// Listeners must be invoked with no store lock held. The change bridge's
/// listener opens a replica transaction, and remote merges call back into
/// `merge_scope` while the replica is locked; notifying under a store lock
/// can deadlock those two paths against each other. Listeners may read the
/// store and may write to it.
pub trait LocalStore: Send + Sync {
    fn get(&self, id: &RecordId) -> Option<Record>;

    fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    fn records(&self) -> Vec<Record>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace records on behalf of the local user.
    fn put(&self, records: Vec<Record>);

    /// Remove records on behalf of the local user. Absent ids are ignored.
    fn remove(&self, ids: &[RecordId]);

    fn listen(&self, listener: StoreListener) -> ListenerHandle;

    /// Run `scope` and apply everything it queued as one batch tagged with
    /// `origin`. Listeners see a single diff carrying that tag.
    fn merge_scope(&self, origin: SyncOrigin, scope: &mut dyn FnMut(&mut MergeBatch));
}

type ListenerRegistry = Mutex<Vec<(u64, StoreListener)>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`LocalStore`] keyed by record id.
pub struct MemoryStore {
    records: RwLock<BTreeMap<RecordId, Record>>,
    listeners: Arc<ListenerRegistry>,
    next_listener: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Seed the store without notifying anyone.
    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        let store = Self::new();
        {
            let mut map = store.write();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<RecordId, Record>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, origin: SyncOrigin, puts: Vec<Record>, removes: &[RecordId]) {
        let diff = {
            let mut records = self.write();
            let mut diff = StoreDiff::new(origin);

            for record in puts {
                match records.get(&record.id) {
                    Some(existing) if *existing == record => {}
                    Some(_) => {
                        records.insert(record.id.clone(), record.clone());
                        diff.updated.push(record);
                    }
                    None => {
                        records.insert(record.id.clone(), record.clone());
                        diff.added.push(record);
                    }
                }
            }

            for id in removes {
                if let Some(previous) = records.remove(id) {
                    diff.removed.push(previous);
                }
            }
            diff
        };

        if !diff.is_empty() {
            self.notify(&diff);
        }
    }

    // Listeners run without any store lock held, so they may read the store.
    fn notify(&self, diff: &StoreDiff) {
        let listeners: Vec<StoreListener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(diff);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, id: &RecordId) -> Option<Record> {
        self.read().get(id).cloned()
    }

    fn contains(&self, id: &RecordId) -> bool {
        self.read().contains_key(id)
    }

    fn records(&self) -> Vec<Record> {
        self.read().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn put(&self, records: Vec<Record>) {
        self.apply(SyncOrigin::Local, records, &[]);
    }

    fn remove(&self, ids: &[RecordId]) {
        self.apply(SyncOrigin::Local, Vec::new(), ids);
    }

    fn listen(&self, listener: StoreListener) -> ListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, listener));

        let registry = Arc::downgrade(&self.listeners);
        ListenerHandle::new(move || {
            if let Some(registry) = registry.upgrade() {
                lock(&registry).retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    fn merge_scope(&self, origin: SyncOrigin, scope: &mut dyn FnMut(&mut MergeBatch)) {
        let mut batch = MergeBatch::default();
        scope(&mut batch);
        if batch.is_empty() {
            return;
        }
        let (puts, removes) = batch.into_parts();
        self.apply(origin, puts, &removes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;

    fn recording_listener(store: &MemoryStore) -> (Arc<Mutex<Vec<StoreDiff>>>, ListenerHandle) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = store.listen(Arc::new(move |diff: &StoreDiff| {
            sink.lock().unwrap().push(diff.clone());
        }));
        (seen, handle)
    }

    #[test]
    fn test_put_reports_added_then_updated() {
        let store = MemoryStore::new();
        let (seen, _handle) = recording_listener(&store);

        store.put(vec![Record::drawable("s1", 1.0, 2.0)]);
        store.put(vec![Record::drawable("s1", 5.0, 2.0)]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].origin, SyncOrigin::Local);
        assert_eq!(seen[0].added.len(), 1);
        assert_eq!(seen[1].updated.len(), 1);
        assert_eq!(seen[1].updated[0].x, 5.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_identical_put_is_silent() {
        let store = MemoryStore::new();
        store.put(vec![Record::drawable("s1", 1.0, 2.0)]);
        let (seen, _handle) = recording_listener(&store);

        store.put(vec![Record::drawable("s1", 1.0, 2.0)]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_absent_is_ignored() {
        let store = MemoryStore::new();
        let (seen, _handle) = recording_listener(&store);

        store.remove(&[RecordId::from("missing")]);
        assert!(seen.lock().unwrap().is_empty());

        store.put(vec![Record::drawable("s1", 0.0, 0.0)]);
        store.remove(&[RecordId::from("s1"), RecordId::from("missing")]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].removed.len(), 1);
        assert_eq!(seen[1].removed[0].kind, RecordKind::Drawable);
    }

    #[test]
    fn test_merge_scope_emits_one_tagged_diff() {
        let store = MemoryStore::with_records([Record::drawable("old", 0.0, 0.0)]);
        let (seen, _handle) = recording_listener(&store);

        store.merge_scope(SyncOrigin::Remote, &mut |batch| {
            batch.put(Record::drawable("a", 1.0, 1.0));
            batch.put(Record::drawable("b", 2.0, 2.0));
            batch.remove(RecordId::from("old"));
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].origin, SyncOrigin::Remote);
        assert_eq!(seen[0].added.len(), 2);
        assert_eq!(seen[0].removed.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_empty_merge_scope_is_silent() {
        let store = MemoryStore::new();
        let (seen, _handle) = recording_listener(&store);
        store.merge_scope(SyncOrigin::Bootstrap, &mut |_batch| {});
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dropping_handle_unsubscribes() {
        let store = MemoryStore::new();
        let (seen, handle) = recording_listener(&store);
        assert_eq!(store.listener_count(), 1);

        drop(handle);
        assert_eq!(store.listener_count(), 0);

        store.put(vec![Record::drawable("s1", 0.0, 0.0)]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let store = MemoryStore::new();
        let (_seen, handle) = recording_listener(&store);
        handle.unsubscribe();
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_listener_may_read_store() {
        let store = Arc::new(MemoryStore::new());
        let observed_len = Arc::new(AtomicU64::new(0));

        let reader = Arc::downgrade(&store);
        let len = observed_len.clone();
        let _handle = store.listen(Arc::new(move |_diff: &StoreDiff| {
            if let Some(store) = reader.upgrade() {
                len.store(store.len() as u64, Ordering::SeqCst);
            }
        }));

        store.put(vec![
            Record::drawable("a", 0.0, 0.0),
            Record::drawable("b", 0.0, 0.0),
        ]);
        assert_eq!(observed_len.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_may_write_store() {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::downgrade(&store);
        let _handle = store.listen(Arc::new(move |diff: &StoreDiff| {
            let Some(store) = writer.upgrade() else {
                return;
            };
            if diff.added.iter().any(|r| r.id.as_str() == "shape") {
                store.put(vec![Record::new("shape-label", RecordKind::Drawable)]);
            }
        }));

        store.put(vec![Record::drawable("shape", 0.0, 0.0)]);
        assert!(store.contains(&RecordId::from("shape-label")));
        assert_eq!(store.len(), 2);
    }
}
