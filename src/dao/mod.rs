/// Backend-agnostic document storage and its implementations.
pub mod document_store;
/// Database model definitions.
pub mod models;
/// Typed access to each collection.
pub mod repositories;
/// Storage abstraction layer for database operations.
pub mod storage;
