//! `weighgate-memory` – durable storage of completed weighings.
//!
//! # Modules
//!
//! - [`repository`] – the [`WeighingRepository`] contract, [`StoreError`],
//!   and the per-instance [`InMemoryRepository`].
//! - [`sqlite`] – [`SqliteRepository`], the production table store.
//! - [`record_store`] – [`RecordStore`]: immediate write, bounded retry
//!   queue, background flush, edge-triggered failure/recovery signals.

pub mod record_store;
pub mod repository;
pub mod sqlite;

pub use record_store::{RecordStore, RecordStoreConfig, Removed, RetryEntry, SaveOutcome};
pub use repository::{InMemoryRepository, OutageSwitch, StoreError, WeighingRepository, WeighingSummary};
pub use sqlite::SqliteRepository;
