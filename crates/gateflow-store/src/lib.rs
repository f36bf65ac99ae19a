pub mod store;

pub use store::SqliteFlowStore;
