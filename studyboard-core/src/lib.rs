//! # studyboard-core — Board records and the local/replicated sync bridge
//!
//! The canvas owns a [`LocalStore`]. A [`ReplicatedDoc`] holds the shared
//! subset of it as a CRDT, and a [`ChangeBridge`] keeps the two in step
//! without echoing changes back to where they came from.

pub mod collab;
pub mod filter;
pub mod origin;
pub mod record;
pub mod store;

pub use collab::bridge::{BootstrapReport, BridgeSubscriptions, ChangeBridge};
pub use collab::guard::{GuardToken, SyncGuard};
pub use collab::stats::{SyncStats, SyncStatsSnapshot};
pub use collab::{ChangeKind, KeyChange, ReplicaError, ReplicaEvent, ReplicaTxn, ReplicatedDoc};
pub use filter::{is_replicable, REPLICABLE_KINDS};
pub use origin::SyncOrigin;
pub use record::{Record, RecordError, RecordId, RecordKind};
pub use store::{ListenerHandle, LocalStore, MemoryStore, MergeBatch, StoreDiff, StoreListener};
