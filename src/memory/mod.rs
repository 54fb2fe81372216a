//! Per-document semantic memory
//!
//! Past interactions are persisted as append-only JSON files, one per source
//! document, and recalled by embedding similarity at query time. Memory only
//! ever enriches a query; a broken memory layer degrades to empty recall.

mod recall;
mod store;

pub use recall::recall_similar;
pub use store::MemoryStore;
