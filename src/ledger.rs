//! Transaction ledger writer with offline resilience.
//!
//! Primary write model: local ledger row + queue entry committed in one
//! SQLite transaction, then an immediate push toward the cloud mirror.
//! A failed push is not an error to the caller — the row stays queued and
//! the sync pass replays it FIFO once connectivity returns. Queue entries
//! carry an `offline_`-prefixed synthetic id that is stripped before the
//! remote insert so the mirror assigns its own identity.

use rusqlite::{params, Connection};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::feed::{FeedEventKind, Subscription, TransactionEvent, TransactionFeed};
use crate::models::{now_rfc3339, NewTransaction, Transaction, TransactionStatus};

/// Marker prefix for queue payload ids that were never accepted remotely.
pub const OFFLINE_ID_PREFIX: &str = "offline_";

/// Cloud ledger mirror seam. Production uses [`crate::api::BackendApi`];
/// tests inject an in-memory double.
#[async_trait::async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Insert one transaction row remotely. Returns the stored row
    /// (including the remote-assigned `id`).
    async fn insert_transaction(&self, payload: Value) -> CoreResult<Value>;

    /// Apply an actor-attributed status transition to a remotely stored
    /// row. Unlike inserts there is no queued fallback; failures surface.
    async fn update_transaction_status(
        &self,
        remote_id: &str,
        status: TransactionStatus,
        actor_id: &str,
        reason: Option<&str>,
    ) -> CoreResult<Value>;
}

/// Outcome of a ledger write. `Queued` is degraded success, not failure.
#[derive(Debug)]
pub enum LedgerWrite {
    /// Row landed on the cloud mirror immediately.
    Stored(Transaction),
    /// Remote write failed; row is durable locally and queued for replay.
    Queued(Transaction),
}

impl LedgerWrite {
    pub fn transaction(&self) -> &Transaction {
        match self {
            LedgerWrite::Stored(tx) | LedgerWrite::Queued(tx) => tx,
        }
    }
}

/// Result of one sync pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// True when another pass was already running and this one backed off.
    pub skipped: bool,
}

/// Explicitly constructed ledger service. Owns its queue state and feed;
/// no ambient global state. Call sites receive it by `Arc`.
pub struct TransactionLedger {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteLedger>,
    feed: TransactionFeed,
    is_syncing: AtomicBool,
    sync_requested: AtomicBool,
}

impl TransactionLedger {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteLedger>) -> Self {
        Self {
            db,
            remote,
            feed: TransactionFeed::new(),
            is_syncing: AtomicBool::new(false),
            sync_requested: AtomicBool::new(false),
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Record a transaction: durable local write first, then an immediate
    /// remote push. Any remote failure degrades to the queued path.
    pub async fn create_transaction(&self, new: NewTransaction) -> CoreResult<LedgerWrite> {
        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            business_id: new.business_id,
            branch_id: new.branch_id,
            department_id: new.department_id,
            staff_id: new.staff_id,
            shift_id: new.shift_id,
            order_id: new.order_id,
            payment_intent_id: new.payment_intent_id,
            amount: new.amount,
            payment_type: new.payment_type,
            payment_reference: new.payment_reference,
            status: TransactionStatus::Created,
            verified_by: None,
            verified_at: None,
            reversed_by: None,
            reversed_at: None,
            reversal_reason: None,
            remote_id: None,
            created_at: now_rfc3339(),
        };

        // Local row + queue entry in one transaction, lock released before
        // any network awaits.
        {
            let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

            let result = (|| -> CoreResult<()> {
                insert_transaction_row(&conn, &tx)?;
                enqueue_transaction(&conn, &tx)?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT")
                        .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        }

        self.push_recorded(tx).await
    }

    /// Announce a freshly committed ledger row and attempt its immediate
    /// remote push. Also the epilogue of the settlement procedure, which
    /// commits the row inside its own transaction scope first.
    pub(crate) async fn push_recorded(&self, tx: Transaction) -> CoreResult<LedgerWrite> {
        self.publish(TransactionEvent {
            kind: FeedEventKind::Recorded,
            business_id: tx.business_id.clone(),
            transaction: tx.clone(),
        });

        match self.remote.insert_transaction(tx.to_remote_payload()).await {
            Ok(remote_row) => {
                let remote_id = remote_row
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from);
                let stored = self.mark_synced(&tx.id, remote_id.as_deref())?;
                info!(tx_id = %tx.id, amount = tx.amount, "transaction secured in cloud ledger");
                Ok(LedgerWrite::Stored(stored))
            }
            Err(e) => {
                warn!(tx_id = %tx.id, error = %e, "primary write failed, transaction queued for offline sync");
                self.record_queue_failure(&tx.id, &e.to_string())?;
                Ok(LedgerWrite::Queued(tx))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queue sync
    // -----------------------------------------------------------------------

    /// Number of transactions waiting for remote replay.
    pub fn offline_count(&self) -> CoreResult<i64> {
        let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE entity_type = 'transaction' AND status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Replay queued transactions FIFO against the cloud mirror. At most
    /// one pass runs at a time per process; a concurrent call backs off
    /// with `skipped = true`. Failed rows stay queued in original order.
    pub async fn sync_queue(&self) -> CoreResult<SyncReport> {
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }
        let _guard = SyncFlagGuard(&self.is_syncing);
        self.sync_requested.store(false, Ordering::SeqCst);

        let pending: Vec<(i64, String, String)> = {
            let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
            let mut stmt = conn.prepare(
                "SELECT id, entity_id, payload FROM sync_queue
                 WHERE entity_type = 'transaction' AND status = 'pending'
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        if pending.is_empty() {
            return Ok(SyncReport::default());
        }

        info!(count = pending.len(), "syncing offline transactions");
        let mut report = SyncReport {
            attempted: pending.len(),
            ..SyncReport::default()
        };

        for (queue_id, entity_id, raw_payload) in pending {
            let mut payload: Value = match serde_json::from_str(&raw_payload) {
                Ok(v) => v,
                Err(e) => {
                    // A malformed payload can never succeed; park it so it
                    // stops blocking the queue.
                    warn!(queue_id, error = %e, "unparseable queue payload, marking failed");
                    self.park_queue_row(queue_id, &format!("payload decode: {e}"))?;
                    report.failed += 1;
                    continue;
                }
            };

            // Strip the synthetic local id so the mirror assigns identity.
            if let Some(obj) = payload.as_object_mut() {
                let is_offline_id = obj
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| id.starts_with(OFFLINE_ID_PREFIX));
                if is_offline_id {
                    obj.remove("id");
                }
            }

            match self.remote.insert_transaction(payload).await {
                Ok(remote_row) => {
                    let remote_id = remote_row
                        .get("id")
                        .and_then(Value::as_str)
                        .map(String::from);
                    let synced = self.mark_synced(&entity_id, remote_id.as_deref())?;
                    self.delete_queue_row(queue_id)?;
                    self.publish(TransactionEvent {
                        kind: FeedEventKind::Synced,
                        business_id: synced.business_id.clone(),
                        transaction: synced,
                    });
                    report.synced += 1;
                }
                Err(e) => {
                    warn!(queue_id, entity_id = %entity_id, error = %e, "sync failed for queued transaction");
                    self.bump_queue_retry(queue_id, &e.to_string())?;
                    report.failed += 1;
                }
            }
        }

        if report.failed == 0 {
            info!(synced = report.synced, "all offline transactions synchronized");
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// Explicit actor-attributed status transition. Applied to the cloud
    /// mirror first so an already-mirrored row never drifts, then to the
    /// local row. Fails loudly — there is no offline queueing for
    /// transitions, only for the initial write.
    pub async fn transition_status(
        &self,
        transaction_id: &str,
        new_status: TransactionStatus,
        actor_id: &str,
        reason: Option<&str>,
    ) -> CoreResult<Transaction> {
        if new_status == TransactionStatus::Created {
            return Err(CoreError::Validation(
                "cannot transition a transaction back to created".into(),
            ));
        }
        if new_status == TransactionStatus::Reversed && reason.map_or(true, |r| r.trim().is_empty())
        {
            return Err(CoreError::Validation(
                "a reversal requires a reason".into(),
            ));
        }

        let current = {
            let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
            load_transaction(&conn, transaction_id)?
        };

        if current.status == TransactionStatus::Reversed {
            return Err(CoreError::AlreadyProcessed(
                "transaction already reversed".into(),
            ));
        }
        if current.status == new_status {
            return Err(CoreError::AlreadyProcessed(format!(
                "transaction already {}",
                new_status.as_str()
            )));
        }

        // Rows the mirror already holds transition remotely first; a
        // failure leaves both sides untouched. Rows still waiting in the
        // queue carry the final status in their queued payload instead.
        if let Some(remote_id) = current.remote_id.as_deref() {
            self.remote
                .update_transaction_status(remote_id, new_status, actor_id, reason)
                .await?;
        }

        let updated = {
            let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
            let now = now_rfc3339();
            match new_status {
                TransactionStatus::Verified => conn.execute(
                    "UPDATE transactions SET status = 'verified',
                            verified_by = ?1, verified_at = ?2, updated_at = ?2
                     WHERE id = ?3",
                    params![actor_id, now, transaction_id],
                )?,
                TransactionStatus::Reversed => conn.execute(
                    "UPDATE transactions SET status = 'reversed',
                            reversed_by = ?1, reversed_at = ?2, reversal_reason = ?3, updated_at = ?2
                     WHERE id = ?4",
                    params![actor_id, now, reason, transaction_id],
                )?,
                TransactionStatus::Disputed => conn.execute(
                    "UPDATE transactions SET status = 'disputed', updated_at = ?1 WHERE id = ?2",
                    params![now, transaction_id],
                )?,
                TransactionStatus::Created => unreachable!(),
            };

            if current.remote_id.is_none() {
                conn.execute(
                    "UPDATE sync_queue
                     SET payload = json_set(payload, '$.status', ?1),
                         updated_at = datetime('now')
                     WHERE entity_type = 'transaction' AND entity_id = ?2",
                    params![new_status.as_str(), transaction_id],
                )?;
            }

            load_transaction(&conn, transaction_id)?
        };

        info!(tx_id = %transaction_id, status = new_status.as_str(), actor = %actor_id, "transaction status transitioned");
        self.publish(TransactionEvent {
            kind: FeedEventKind::StatusChanged,
            business_id: updated.business_id.clone(),
            transaction: updated.clone(),
        });
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Feed
    // -----------------------------------------------------------------------

    /// Subscribe to this tenant's transaction activity. Every delivered
    /// event also raises the sync-request flag so the engine piggy-backs a
    /// queue replay on observed activity.
    pub fn subscribe(&self, business_id: &str) -> Subscription {
        self.feed.subscribe(business_id)
    }

    /// Feed in a change observed on the cloud mirror (e.g. another
    /// terminal's write) — fanned out to listeners and used as a sync cue.
    pub fn notify_remote_change(&self, event: TransactionEvent) {
        self.publish(event);
    }

    fn publish(&self, event: TransactionEvent) {
        self.feed.publish(event);
        self.sync_requested.store(true, Ordering::SeqCst);
    }

    /// Raise the sync-request flag without an event, e.g. when the caller
    /// has out-of-band knowledge that connectivity returned.
    pub fn request_sync(&self) {
        self.sync_requested.store(true, Ordering::SeqCst);
    }

    /// Consume the piggy-backed sync request, if one is pending.
    pub fn take_sync_request(&self) -> bool {
        self.sync_requested.swap(false, Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Row helpers
    // -----------------------------------------------------------------------

    fn mark_synced(&self, transaction_id: &str, remote_id: Option<&str>) -> CoreResult<Transaction> {
        let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        conn.execute(
            "UPDATE transactions SET remote_id = ?1, sync_status = 'synced', updated_at = ?2
             WHERE id = ?3",
            params![remote_id, now_rfc3339(), transaction_id],
        )?;
        conn.execute(
            "DELETE FROM sync_queue WHERE entity_type = 'transaction' AND entity_id = ?1",
            params![transaction_id],
        )?;
        load_transaction(&conn, transaction_id)
    }

    fn record_queue_failure(&self, transaction_id: &str, error: &str) -> CoreResult<()> {
        let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        conn.execute(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?1,
                    updated_at = datetime('now')
             WHERE entity_type = 'transaction' AND entity_id = ?2",
            params![error, transaction_id],
        )?;
        Ok(())
    }

    fn bump_queue_retry(&self, queue_id: i64, error: &str) -> CoreResult<()> {
        let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        conn.execute(
            "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?1,
                    updated_at = datetime('now')
             WHERE id = ?2",
            params![error, queue_id],
        )?;
        Ok(())
    }

    fn park_queue_row(&self, queue_id: i64, error: &str) -> CoreResult<()> {
        let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        conn.execute(
            "UPDATE sync_queue SET status = 'failed', last_error = ?1, updated_at = datetime('now')
             WHERE id = ?2",
            params![error, queue_id],
        )?;
        Ok(())
    }

    fn delete_queue_row(&self, queue_id: i64) -> CoreResult<()> {
        let conn = self.db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![queue_id])?;
        Ok(())
    }
}

/// Resets the reentrancy flag even on early return.
struct SyncFlagGuard<'a>(&'a AtomicBool);

impl Drop for SyncFlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Shared SQL (also used by the settlement procedure, inside its own
// transaction scope)
// ---------------------------------------------------------------------------

pub(crate) fn insert_transaction_row(conn: &Connection, tx: &Transaction) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO transactions (
            id, business_id, branch_id, department_id, staff_id, shift_id,
            order_id, payment_intent_id, amount, payment_type, payment_reference,
            status, remote_id, sync_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, 'pending', ?13, ?13)",
        params![
            tx.id,
            tx.business_id,
            tx.branch_id,
            tx.department_id,
            tx.staff_id,
            tx.shift_id,
            tx.order_id,
            tx.payment_intent_id,
            tx.amount,
            tx.payment_type.as_str(),
            tx.payment_reference,
            tx.status.as_str(),
            tx.created_at,
        ],
    )
    .map_err(|e| CoreError::Db(format!("insert transaction: {e}")))?;
    Ok(())
}

pub(crate) fn enqueue_transaction(conn: &Connection, tx: &Transaction) -> CoreResult<()> {
    // Stable idempotency key so retries reuse the same key and the
    // backend deduplicates.
    let idempotency_key = format!("transaction:{}", tx.id);
    let mut payload = tx.to_remote_payload();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(
            "id".into(),
            Value::String(format!("{OFFLINE_ID_PREFIX}{}", tx.id)),
        );
    }
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
         VALUES ('transaction', ?1, 'insert', ?2, ?3)",
        params![tx.id, payload.to_string(), idempotency_key],
    )
    .map_err(|e| CoreError::Db(format!("enqueue transaction sync: {e}")))?;
    Ok(())
}

pub(crate) fn load_transaction(conn: &Connection, id: &str) -> CoreResult<Transaction> {
    conn.query_row(
        "SELECT * FROM transactions WHERE id = ?1",
        params![id],
        Transaction::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            CoreError::Validation(format!("transaction not found: {id}"))
        }
        other => CoreError::Db(other.to_string()),
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::PaymentMethod;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory remote double. `fail_amounts` rejects specific rows so
    /// tests can exercise partial sync passes.
    #[derive(Default)]
    struct MockRemote {
        offline: AtomicBool,
        fail_amounts: Mutex<HashSet<i64>>,
        inserted: Mutex<Vec<Value>>,
        status_updates: Mutex<Vec<(String, TransactionStatus)>>,
    }

    #[async_trait::async_trait]
    impl RemoteLedger for MockRemote {
        async fn insert_transaction(&self, payload: Value) -> CoreResult<Value> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(CoreError::Transient("connection refused".into()));
            }
            let amount = payload.get("amount").and_then(Value::as_i64).unwrap_or(0);
            if self.fail_amounts.lock().unwrap().contains(&amount) {
                return Err(CoreError::Transient("backend server error".into()));
            }
            let remote_id = format!("rmt-{}", self.inserted.lock().unwrap().len() + 1);
            self.inserted.lock().unwrap().push(payload);
            Ok(serde_json::json!({ "id": remote_id }))
        }

        async fn update_transaction_status(
            &self,
            remote_id: &str,
            status: TransactionStatus,
            _actor_id: &str,
            _reason: Option<&str>,
        ) -> CoreResult<Value> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(CoreError::Transient("connection refused".into()));
            }
            self.status_updates
                .lock()
                .unwrap()
                .push((remote_id.to_string(), status));
            Ok(serde_json::json!({}))
        }
    }

    fn ledger_with_mock() -> (TransactionLedger, Arc<MockRemote>) {
        let db = Arc::new(db::open_in_memory_for_test());
        let remote = Arc::new(MockRemote::default());
        (TransactionLedger::new(db, remote.clone()), remote)
    }

    fn new_tx(amount: i64) -> NewTransaction {
        NewTransaction {
            business_id: "biz-1".into(),
            branch_id: "br-1".into(),
            department_id: None,
            staff_id: "staff-1".into(),
            shift_id: Some("shift-1".into()),
            order_id: None,
            payment_intent_id: None,
            amount,
            payment_type: PaymentMethod::Cash,
            payment_reference: None,
        }
    }

    #[tokio::test]
    async fn test_direct_write_lands_remotely() {
        let (ledger, remote) = ledger_with_mock();
        let write = ledger.create_transaction(new_tx(2500)).await.unwrap();

        let LedgerWrite::Stored(tx) = write else {
            panic!("expected direct write to store remotely");
        };
        assert_eq!(tx.remote_id.as_deref(), Some("rmt-1"));
        assert_eq!(ledger.offline_count().unwrap(), 0);
        assert_eq!(remote.inserted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_queues_not_errors() {
        let (ledger, remote) = ledger_with_mock();
        remote.offline.store(true, Ordering::SeqCst);

        let write = ledger.create_transaction(new_tx(7500)).await.unwrap();
        assert!(matches!(write, LedgerWrite::Queued(_)));
        assert_eq!(ledger.offline_count().unwrap(), 1);

        // Queue payload carries the synthetic offline id marker.
        let conn = ledger.db().conn.lock().unwrap();
        let payload: String = conn
            .query_row("SELECT payload FROM sync_queue", [], |row| row.get(0))
            .unwrap();
        let payload: Value = serde_json::from_str(&payload).unwrap();
        assert!(payload["id"]
            .as_str()
            .unwrap()
            .starts_with(OFFLINE_ID_PREFIX));
    }

    #[tokio::test]
    async fn test_sync_pass_drains_queue_exactly_once() {
        let (ledger, remote) = ledger_with_mock();
        remote.offline.store(true, Ordering::SeqCst);
        ledger.create_transaction(new_tx(7500)).await.unwrap();
        assert_eq!(ledger.offline_count().unwrap(), 1);

        remote.offline.store(false, Ordering::SeqCst);
        let report = ledger.sync_queue().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(ledger.offline_count().unwrap(), 0);

        // Exactly one remote copy, with the offline marker stripped.
        let inserted = remote.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert!(inserted[0].get("id").is_none());

        // A second pass is a no-op — no duplication.
        drop(inserted);
        let report = ledger.sync_queue().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(remote.inserted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_requeues_failures_in_original_order() {
        let (ledger, remote) = ledger_with_mock();
        remote.offline.store(true, Ordering::SeqCst);
        ledger.create_transaction(new_tx(100)).await.unwrap();
        ledger.create_transaction(new_tx(200)).await.unwrap();
        ledger.create_transaction(new_tx(300)).await.unwrap();

        remote.offline.store(false, Ordering::SeqCst);
        remote.fail_amounts.lock().unwrap().insert(200);

        let report = ledger.sync_queue().await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(ledger.offline_count().unwrap(), 1);

        // Replay preserved FIFO: 100 before 300; 200 still queued.
        {
            let inserted = remote.inserted.lock().unwrap();
            let amounts: Vec<i64> = inserted
                .iter()
                .map(|p| p["amount"].as_i64().unwrap())
                .collect();
            assert_eq!(amounts, vec![100, 300]);
        }

        remote.fail_amounts.lock().unwrap().clear();
        let report = ledger.sync_queue().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(ledger.offline_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_reentrancy_guard() {
        let (ledger, remote) = ledger_with_mock();
        remote.offline.store(true, Ordering::SeqCst);
        ledger.create_transaction(new_tx(100)).await.unwrap();

        ledger.is_syncing.store(true, Ordering::SeqCst);
        let report = ledger.sync_queue().await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.attempted, 0);

        ledger.is_syncing.store(false, Ordering::SeqCst);
        remote.offline.store(false, Ordering::SeqCst);
        let report = ledger.sync_queue().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_reversal_requires_reason() {
        let (ledger, _remote) = ledger_with_mock();
        let write = ledger.create_transaction(new_tx(500)).await.unwrap();
        let tx_id = write.transaction().id.clone();

        let err = ledger
            .transition_status(&tx_id, TransactionStatus::Reversed, "mgr-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        let reversed = ledger
            .transition_status(
                &tx_id,
                TransactionStatus::Reversed,
                "mgr-1",
                Some("duplicate charge"),
            )
            .await
            .unwrap();
        assert_eq!(reversed.status, TransactionStatus::Reversed);
        assert_eq!(reversed.reversed_by.as_deref(), Some("mgr-1"));
        assert_eq!(reversed.reversal_reason.as_deref(), Some("duplicate charge"));
    }

    #[tokio::test]
    async fn test_reversed_is_terminal() {
        let (ledger, _remote) = ledger_with_mock();
        let write = ledger.create_transaction(new_tx(500)).await.unwrap();
        let tx_id = write.transaction().id.clone();

        ledger
            .transition_status(&tx_id, TransactionStatus::Reversed, "mgr-1", Some("fraud"))
            .await
            .unwrap();
        let err = ledger
            .transition_status(&tx_id, TransactionStatus::Verified, "mgr-1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn test_verify_stamps_actor_metadata() {
        let (ledger, _remote) = ledger_with_mock();
        let write = ledger.create_transaction(new_tx(900)).await.unwrap();
        let tx_id = write.transaction().id.clone();

        let verified = ledger
            .transition_status(&tx_id, TransactionStatus::Verified, "auditor-7", None)
            .await
            .unwrap();
        assert_eq!(verified.status, TransactionStatus::Verified);
        assert_eq!(verified.verified_by.as_deref(), Some("auditor-7"));
        assert!(verified.verified_at.is_some());
    }

    #[tokio::test]
    async fn test_transition_updates_cloud_mirror() {
        let (ledger, remote) = ledger_with_mock();
        let write = ledger.create_transaction(new_tx(900)).await.unwrap();
        let tx = write.transaction().clone();
        assert_eq!(tx.remote_id.as_deref(), Some("rmt-1"));

        ledger
            .transition_status(&tx.id, TransactionStatus::Verified, "auditor-7", None)
            .await
            .unwrap();

        let updates = remote.status_updates.lock().unwrap();
        assert_eq!(
            updates.as_slice(),
            &[("rmt-1".to_string(), TransactionStatus::Verified)]
        );
    }

    #[tokio::test]
    async fn test_transition_fails_loudly_when_mirror_unreachable() {
        let (ledger, remote) = ledger_with_mock();
        let write = ledger.create_transaction(new_tx(900)).await.unwrap();
        let tx_id = write.transaction().id.clone();

        remote.offline.store(true, Ordering::SeqCst);
        let err = ledger
            .transition_status(&tx_id, TransactionStatus::Verified, "auditor-7", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));

        // Neither side moved: the local row is still created.
        let conn = ledger.db().conn.lock().unwrap();
        let local = load_transaction(&conn, &tx_id).unwrap();
        assert_eq!(local.status, TransactionStatus::Created);
        assert!(remote.status_updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsynced_transition_travels_in_queue_payload() {
        let (ledger, remote) = ledger_with_mock();
        remote.offline.store(true, Ordering::SeqCst);
        let write = ledger.create_transaction(new_tx(900)).await.unwrap();
        let tx_id = write.transaction().id.clone();

        // The row only exists locally, so the transition applies locally
        // and rides along in the queued payload.
        let verified = ledger
            .transition_status(&tx_id, TransactionStatus::Verified, "auditor-7", None)
            .await
            .unwrap();
        assert_eq!(verified.status, TransactionStatus::Verified);

        remote.offline.store(false, Ordering::SeqCst);
        ledger.sync_queue().await.unwrap();

        let inserted = remote.inserted.lock().unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0]["status"], "verified");
        assert!(
            remote.status_updates.lock().unwrap().is_empty(),
            "no separate remote transition for a row the mirror never had"
        );
    }

    #[tokio::test]
    async fn test_feed_event_and_sync_piggyback() {
        let (ledger, _remote) = ledger_with_mock();
        let mut sub = ledger.subscribe("biz-1");
        assert!(!ledger.take_sync_request());

        ledger.create_transaction(new_tx(1200)).await.unwrap();

        let event = sub.try_recv().expect("recorded event delivered");
        assert_eq!(event.kind, FeedEventKind::Recorded);
        assert_eq!(event.transaction.amount, 1200);
        assert!(ledger.take_sync_request(), "publish raises the sync flag");
        assert!(!ledger.take_sync_request(), "flag is consumed");
    }
}
