//! Payment settlement: intent creation and atomic confirmation.
//!
//! Confirming an intent is one transaction against the local store: the
//! pending check, the ledger insert, the intent flip to confirmed, and the
//! order flip to paid commit together or not at all. A repeated confirm
//! therefore fails the pending check and reports the duplicate instead of
//! double-charging.

use rusqlite::params;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{self, LedgerWrite, TransactionLedger};
use crate::models::{
    now_rfc3339, IntentStatus, Order, OrderStatus, PaymentIntent, PaymentMethod, Transaction,
    TransactionStatus,
};
use crate::orders::load_order;
use crate::shifts;

/// Result of a confirmed settlement. `write` reports whether the ledger
/// row already reached the cloud mirror or is queued for sync.
#[derive(Debug)]
pub struct SettlementOutcome {
    pub intent: PaymentIntent,
    pub order: Order,
    pub write: LedgerWrite,
}

pub struct SettlementService {
    ledger: Arc<TransactionLedger>,
}

impl SettlementService {
    pub fn new(ledger: Arc<TransactionLedger>) -> Self {
        Self { ledger }
    }

    fn db(&self) -> &Arc<DbState> {
        self.ledger.db()
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    /// Create a pending intent for an open order. The expected amount is
    /// the order total at creation time.
    pub fn create_intent(
        &self,
        order_id: &str,
        payment_type: PaymentMethod,
        staff_id: &str,
        shift_id: Option<&str>,
    ) -> CoreResult<PaymentIntent> {
        let conn = self.db().conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        let order = load_order(&conn, order_id)?;
        if order.status != OrderStatus::Open {
            return Err(CoreError::Validation(format!(
                "cannot take payment for a {} order",
                order.status.as_str()
            )));
        }

        let intent = PaymentIntent {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            business_id: order.business_id.clone(),
            branch_id: order.branch_id.clone(),
            staff_id: Some(staff_id.to_string()),
            shift_id: shift_id.map(String::from),
            expected_amount: order.total,
            payment_type,
            status: IntentStatus::Pending,
            external_reference: None,
            created_at: now_rfc3339(),
        };
        conn.execute(
            "INSERT INTO payment_intents (
                id, order_id, business_id, branch_id, staff_id, shift_id,
                expected_amount, payment_type, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)",
            params![
                intent.id,
                intent.order_id,
                intent.business_id,
                intent.branch_id,
                intent.staff_id,
                intent.shift_id,
                intent.expected_amount,
                intent.payment_type.as_str(),
                intent.created_at,
            ],
        )?;
        drop(conn);

        info!(intent_id = %intent.id, order_id, method = payment_type.as_str(), "payment intent created");
        Ok(intent)
    }

    /// The most recent pending intent for an order, if any. At most one
    /// non-voided intent exists per order at settlement time, so a method
    /// change retargets the existing intent instead of stacking a second.
    pub fn pending_intent(&self, order_id: &str) -> CoreResult<Option<PaymentIntent>> {
        let conn = self.db().conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT * FROM payment_intents
             WHERE order_id = ?1 AND status = 'pending'
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![order_id], PaymentIntent::from_row)?;
        match rows.next() {
            Some(intent) => Ok(Some(intent?)),
            None => Ok(None),
        }
    }

    /// Switch a pending intent to a different payment method, e.g. when
    /// the guest changes their mind at the confirmation screen.
    fn retarget_intent(
        &self,
        intent_id: &str,
        payment_type: PaymentMethod,
    ) -> CoreResult<PaymentIntent> {
        let conn = self.db().conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        let affected = conn.execute(
            "UPDATE payment_intents SET payment_type = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![payment_type.as_str(), now_rfc3339(), intent_id],
        )?;
        if affected == 0 {
            let intent = load_intent(&conn, intent_id)?;
            return Err(CoreError::AlreadyProcessed(format!(
                "intent is already {}",
                intent.status.as_str()
            )));
        }
        let intent = load_intent(&conn, intent_id)?;
        drop(conn);
        info!(intent_id, method = payment_type.as_str(), "payment intent retargeted");
        Ok(intent)
    }

    /// Void a pending intent. Confirmed and voided intents are terminal.
    pub fn void_intent(&self, intent_id: &str) -> CoreResult<PaymentIntent> {
        let conn = self.db().conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
        let affected = conn.execute(
            "UPDATE payment_intents SET status = 'voided', updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now_rfc3339(), intent_id],
        )?;
        if affected == 0 {
            let intent = load_intent(&conn, intent_id)?;
            return Err(CoreError::AlreadyProcessed(format!(
                "intent is already {}",
                intent.status.as_str()
            )));
        }
        let intent = load_intent(&conn, intent_id)?;
        drop(conn);
        info!(intent_id, "payment intent voided");
        Ok(intent)
    }

    // -----------------------------------------------------------------------
    // Confirmation
    // -----------------------------------------------------------------------

    /// Settle an order in one step: method preconditions, open-shift check,
    /// just-in-time intent creation, then atomic confirmation.
    pub async fn settle_order(
        &self,
        order_id: &str,
        payment_type: PaymentMethod,
        staff_id: &str,
        external_reference: Option<&str>,
    ) -> CoreResult<SettlementOutcome> {
        check_reference_requirement(payment_type, external_reference)?;

        let shift = shifts::active_shift(self.db(), staff_id)?.ok_or_else(|| {
            CoreError::Validation("an open shift is required to take payment".into())
        })?;

        let intent = match self.pending_intent(order_id)? {
            Some(existing) if existing.payment_type == payment_type => existing,
            Some(existing) => self.retarget_intent(&existing.id, payment_type)?,
            None => self.create_intent(order_id, payment_type, staff_id, Some(&shift.id))?,
        };
        self.confirm_intent(&intent.id, staff_id, external_reference)
            .await
    }

    /// Confirm a pending intent: insert the ledger row, mark the intent
    /// confirmed, and mark the order paid in a single transaction. Fails
    /// with `AlreadyProcessed` when the intent is no longer pending.
    pub async fn confirm_intent(
        &self,
        intent_id: &str,
        staff_id: &str,
        external_reference: Option<&str>,
    ) -> CoreResult<SettlementOutcome> {
        let (tx, intent, order) = {
            let conn = self.db().conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| CoreError::Db(format!("begin transaction: {e}")))?;

            let result = (|| -> CoreResult<(Transaction, PaymentIntent, Order)> {
                let intent = load_intent(&conn, intent_id)?;
                if intent.status != IntentStatus::Pending {
                    return Err(CoreError::AlreadyProcessed(format!(
                        "payment intent is already {}",
                        intent.status.as_str()
                    )));
                }
                check_reference_requirement(intent.payment_type, external_reference)?;

                let order = load_order(&conn, &intent.order_id)?;
                if order.status != OrderStatus::Open {
                    return Err(CoreError::AlreadyProcessed(format!(
                        "order is already {}",
                        order.status.as_str()
                    )));
                }

                let now = now_rfc3339();
                let tx = Transaction {
                    id: Uuid::new_v4().to_string(),
                    business_id: intent.business_id.clone(),
                    branch_id: intent.branch_id.clone(),
                    department_id: None,
                    staff_id: staff_id.to_string(),
                    shift_id: intent.shift_id.clone(),
                    order_id: Some(order.id.clone()),
                    payment_intent_id: Some(intent.id.clone()),
                    amount: intent.expected_amount,
                    payment_type: intent.payment_type,
                    payment_reference: external_reference.map(String::from),
                    status: TransactionStatus::Created,
                    verified_by: None,
                    verified_at: None,
                    reversed_by: None,
                    reversed_at: None,
                    reversal_reason: None,
                    remote_id: None,
                    created_at: now.clone(),
                };
                ledger::insert_transaction_row(&conn, &tx)?;
                ledger::enqueue_transaction(&conn, &tx)?;

                conn.execute(
                    "UPDATE payment_intents SET status = 'confirmed',
                            external_reference = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![external_reference, now, intent.id],
                )?;
                conn.execute(
                    "UPDATE orders SET status = 'paid', updated_at = ?1 WHERE id = ?2",
                    params![now, order.id],
                )?;

                let intent = load_intent(&conn, intent_id)?;
                let order = load_order(&conn, &order.id)?;
                Ok((tx, intent, order))
            })();

            match result {
                Ok(value) => {
                    conn.execute_batch("COMMIT")
                        .map_err(|e| CoreError::Db(format!("commit: {e}")))?;
                    value
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    warn!(intent_id, error = %e, "settlement rejected");
                    return Err(e);
                }
            }
        };

        info!(
            intent_id,
            order_id = %order.id,
            amount = tx.amount,
            method = tx.payment_type.as_str(),
            "payment settled"
        );
        let write = self.ledger.push_recorded(tx).await?;
        Ok(SettlementOutcome {
            intent,
            order,
            write,
        })
    }
}

/// POS and card settlements go through the physical terminal, so the
/// receipt reference is mandatory before the confirm is attempted.
fn check_reference_requirement(
    payment_type: PaymentMethod,
    external_reference: Option<&str>,
) -> CoreResult<()> {
    let needs_reference = matches!(payment_type, PaymentMethod::Pos | PaymentMethod::Card);
    if needs_reference && external_reference.map_or(true, |r| r.trim().is_empty()) {
        return Err(CoreError::Validation(
            "a terminal receipt reference is required for POS payments".into(),
        ));
    }
    Ok(())
}

fn load_intent(conn: &rusqlite::Connection, intent_id: &str) -> CoreResult<PaymentIntent> {
    conn.query_row(
        "SELECT * FROM payment_intents WHERE id = ?1",
        params![intent_id],
        PaymentIntent::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            CoreError::Validation(format!("payment intent not found: {intent_id}"))
        }
        other => CoreError::Db(other.to_string()),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
