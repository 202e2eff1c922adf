pub mod database_ops;
pub mod orchestrator;
pub mod snapshot;
pub mod tracing;

pub mod util {
    pub mod env;
}

pub use database_ops::catalog::{
    CatalogError, CatalogPage, HttpCatalogClient, HttpCatalogConfig, RawRecord,
    RemoteCatalogClient, ScriptedCatalogClient,
};
pub use database_ops::db::Db;
pub use database_ops::products::{CanonicalProduct, PageReconciliation, ProductUpsertStore};
pub use database_ops::sync_runs::{RunStatus, SyncRun, SyncRunStore};
pub use orchestrator::{SyncConfig, SyncError, SyncOrchestrator, SyncSummary};
pub use snapshot::{build_quote_snapshot, QuoteSnapshot};
