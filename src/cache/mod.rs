//! Response cache organised in named generations.
//!
//! Each generation is a named cache of GET responses keyed by method + URL.
//! Exactly one generation is current; the lifecycle controller sweeps the rest.

mod storage;
mod traits;

pub use storage::{ResponseStore, SqliteResponseStore};
pub use traits::{CachedEntry, HttpResponse, RequestKey, ResponseSource};
