//! # Check-in Sync
//!
//! Mirrors the [`checkin_engine`] record store to a quota-limited spreadsheet
//! backend.
//!
//! ## Architecture
//!
//! - Every call to the backend goes through one [`RequestScheduler`] lane:
//!   one request in flight, starts spaced by a minimum interval, rate quota
//!   and transient failures retried with backoff
//! - Local writes are coalesced per id by the [`BatchAccumulator`] and sent
//!   as at most one update call plus one append call per flush
//! - A pull reads the whole sheet and reconciles it into the store; a local
//!   record with unconfirmed changes always beats the remote copy
//! - The [`SyncFacade`] ties these together and [`CheckinService`] exposes the
//!   operations the CRUD layer calls
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use checkin_sync::{CheckinService, MemorySheet, SyncConfig};
//! use checkin_engine::NewRecord;
//! use std::sync::Arc;
//!
//! # async fn run() -> checkin_sync::SyncResult<()> {
//! let sheet = Arc::new(MemorySheet::new());
//! let service = CheckinService::open(sheet, SyncConfig::load()?).await?;
//!
//! let ada = service.create_record(NewRecord::new("Ada Lovelace"))?;
//! service.mark_present(&ada.id, checkin_engine::now_millis())?;
//!
//! let report = service.force_sync().await;
//! assert!(report.is_success());
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod batch;
pub mod config;
mod context;
pub mod error;
pub mod facade;
pub mod pull;
pub mod row_index;
pub mod scheduler;
pub mod service;
pub mod telemetry;

pub use backend::{CallKind, MemorySheet, RangeUpdate, RecordedCall, RemoteBackend, SharedBackend};
pub use batch::{BatchAccumulator, BatchStats, FlushOutcome};
pub use config::{ConfigError, RetryPolicy, SyncConfig};
pub use error::{BackendError, BackendResult, ErrorClass, SyncError, SyncResult};
pub use facade::{DeleteOutcome, SyncFacade, SyncReport, SyncStats};
pub use pull::ReconcileReport;
pub use row_index::RowIndex;
pub use scheduler::{RequestScheduler, SchedulerStats};
pub use service::CheckinService;
pub use telemetry::init_tracing;
