//! Background sync engine.
//!
//! Drives the offline transaction queue: a periodic full pass plus
//! opportunistic passes whenever ledger activity raises the sync-request
//! flag. The engine runs as a tracked tokio task and shuts down cleanly
//! through a cancellation token.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::ledger::TransactionLedger;
use crate::models::now_rfc3339;

/// How often the engine polls the sync-request flag.
const POLL_TICK: Duration = Duration::from_secs(1);

/// Unconditional full pass interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub offline_count: i64,
    pub last_sync_at: Option<String>,
}

pub struct SyncEngine {
    ledger: Arc<TransactionLedger>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    last_sync: Arc<Mutex<Option<String>>>,
}

impl SyncEngine {
    pub fn new(ledger: Arc<TransactionLedger>) -> Self {
        // Pick up the persisted watermark so status survives restarts.
        let last_sync = ledger
            .db()
            .conn
            .lock()
            .ok()
            .and_then(|conn| db::get_setting(&conn, "sync", "last_sync_at"));
        Self {
            ledger,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            last_sync: Arc::new(Mutex::new(last_sync)),
        }
    }

    /// Spawn the sync loop. Call once; the loop runs until [`stop`].
    ///
    /// [`stop`]: SyncEngine::stop
    pub fn start(&self, interval: Duration) {
        let ledger = Arc::clone(&self.ledger);
        let cancel = self.cancel.clone();
        let last_sync = Arc::clone(&self.last_sync);

        self.tracker.spawn(async move {
            info!(interval_secs = interval.as_secs(), "sync engine started");
            let mut since_full_pass = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_TICK) => {}
                }

                since_full_pass += POLL_TICK;
                let due = since_full_pass >= interval;
                if !due && !ledger.take_sync_request() {
                    continue;
                }
                since_full_pass = Duration::ZERO;

                match ledger.sync_queue().await {
                    Ok(report) if report.skipped => {
                        debug!("sync pass skipped, another pass in flight");
                    }
                    Ok(report) => {
                        if report.attempted > 0 {
                            info!(
                                synced = report.synced,
                                failed = report.failed,
                                "sync pass finished"
                            );
                        }
                        let stamp = now_rfc3339();
                        if let Ok(mut last) = last_sync.lock() {
                            *last = Some(stamp.clone());
                        }
                        if let Ok(conn) = ledger.db().conn.lock() {
                            let _ = db::set_setting(&conn, "sync", "last_sync_at", &stamp);
                        }
                    }
                    Err(e) => warn!(error = %e, "sync pass failed"),
                }
            }
            info!("sync engine stopped");
        });
    }

    /// Request an out-of-band pass on the next poll tick.
    pub fn request_sync(&self) {
        self.ledger.request_sync();
    }

    pub fn status(&self) -> CoreResult<SyncStatus> {
        Ok(SyncStatus {
            running: !self.cancel.is_cancelled(),
            offline_count: self.ledger.offline_count()?,
            last_sync_at: self
                .last_sync
                .lock()
                .map_err(|e| CoreError::Db(e.to_string()))?
                .clone(),
        })
    }

    /// Stop the loop and wait for the task to drain.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
