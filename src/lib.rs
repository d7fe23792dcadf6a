//! CARSS operations core.
//!
//! Lifecycle engine for a multi-tenant hospitality point of sale: orders,
//! payment intents with atomic settlement, an append-only transaction
//! ledger with an offline sync queue, shift reconciliation, and the
//! fulfillment gate. The local SQLite database is the transactional
//! authority; the cloud backend is a mirror fed through the sync queue.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod db;
pub mod error;
pub mod feed;
pub mod fulfillment;
pub mod ledger;
pub mod models;
pub mod orders;
pub mod session;
pub mod settlement;
pub mod shifts;
pub mod storage;
pub mod sync;

pub use error::{CoreError, CoreResult};
pub use ledger::{LedgerWrite, RemoteLedger, SyncReport, TransactionLedger};
pub use models::Money;
pub use settlement::{SettlementOutcome, SettlementService};
pub use shifts::{CountedTotals, ShiftClose};
pub use sync::SyncEngine;

/// Initialize structured logging (console + daily rolling file).
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,carss_core=debug"));

    let file_appender = tracing_appender::rolling::daily(log_dir, "carss");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("carss-core v{} logging initialized", env!("CARGO_PKG_VERSION"));
    Ok(guard)
}
