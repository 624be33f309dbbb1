//! Persistent pipeline state.
//!
//! * [`record`]: [`ProcessingRecord`], the per-book flags and identifiers
//! * [`store`] : the [`StateStore`] contract with file and in-memory backends
//! * [`corpus`]: corpus enumeration and the manual-review list
//! * [`audit`] : read-only consistency report across all records

pub mod audit;
pub mod corpus;
pub mod record;
pub mod store;

pub use audit::{audit, AuditReport};
pub use corpus::{relative_dir, scan_corpus, ReviewList};
pub use record::{location_key, new_book_id, ProcessingRecord, Stage, StageFlags};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
