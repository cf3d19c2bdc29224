// Readers for the four external systems

pub mod analytics;
pub mod batch;
pub mod object_store;
pub mod sql;

pub use analytics::{AnalyticsOptions, AnalyticsReader};
pub use batch::{BatchEngineReader, BatchOptions, BatchRun, RemoteOutput};
pub use object_store::ObjectStore;
pub use sql::{SqlConnectionOptions, SqlReader, SqlSource};
