pub mod document_store;
pub mod sql;

pub use document_store::SqliteResourceStore;
