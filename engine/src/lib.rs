//! # Check-in Engine
//!
//! The synchronous core of the attendee check-in sync engine.
//!
//! This crate owns the authoritative in-memory record set and the pure
//! reconciliation logic used to merge it with a remote spreadsheet snapshot.
//! It performs no IO: talking to the remote backend, pacing requests and
//! batching writes live in the `checkin-sync` crate.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files or the network
//! - **Deterministic**: reconciliation walks ids in sorted order, so the same
//!   inputs always produce the same plan
//! - **Per-record locking**: the [`LocalStore`] is a sharded map, so writers on
//!   different ids never contend on a global lock
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is one attendee: descriptive fields plus presence and badge
//! printing status. Each record stored locally carries a [`SyncState`] that
//! tracks whether it has local changes the remote has not confirmed yet.
//!
//! ### Change stamps
//!
//! Every local mutation is stamped by the store's [`ChangeClock`]. Stamps are
//! strictly increasing, which lets a flush tell whether the record it sent is
//! still the latest local version.
//!
//! ### Rows
//!
//! The remote backend is a sheet. The [`row`] module maps records to ordered
//! cell tuples ([`RawRow`]) and back, with the id in a fixed column.
//!
//! ### Reconciliation
//!
//! The [`Reconciler`] turns local state plus a remote snapshot into a
//! [`ReconcilePlan`]. A pending local record beats the remote copy; a
//! confirmed local record loses to it.
//!
//! ## Quick Start
//!
//! ```rust
//! use checkin_engine::{LocalStore, NewRecord, Upsert};
//!
//! let store = LocalStore::new();
//! let record = NewRecord::new("Ada Lovelace")
//!     .with_email("ada@example.com")
//!     .into_record("att-1", 1_706_745_600_000)
//!     .unwrap();
//!
//! let outcome = store.upsert(record, 1_706_745_600_000).unwrap();
//! assert!(matches!(outcome, Upsert::Changed(_)));
//! assert_eq!(store.pending_records().len(), 1);
//! ```

pub mod clock;
pub mod error;
pub mod patch;
pub mod reconcile;
pub mod record;
pub mod row;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use clock::{now_millis, ChangeClock};
pub use error::Error;
pub use patch::{NewRecord, RecordPatch};
pub use reconcile::{Conflict, ConflictResolution, ReconcilePlan, Reconciler};
pub use record::{Record, StoredRecord, SyncState};
pub use row::{RawRow, RowAddress, RowOutcome, COLUMNS, FIRST_DATA_ROW};
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{Adopt, LocalStore, Upsert};

/// Type aliases for clarity
pub type RecordId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
