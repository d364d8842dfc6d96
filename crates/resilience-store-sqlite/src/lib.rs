//! SQLite backend for the ResiliencePro profile store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. The `profiles` table carries a unique
//! index on `subject_id`, which is what keeps concurrent first-time sign-ins
//! from producing two rows. Opening a table created before that index first
//! collapses any duplicate rows, keeping the most senior one per subject.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteProfileStore;
