//! Subcommand handlers

pub mod dashboard;
pub mod diagnose;
pub mod setup;
pub mod stats;
pub mod wrap;

use std::path::Path;

/// Whether `database` names something that exists
pub(crate) fn database_exists(database: &str) -> bool {
    database == argus_core::storage::MEMORY_DATABASE || Path::new(database).exists()
}

/// Resolves on Ctrl-C
pub(crate) async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
