//! Order lifecycle: open -> paid -> served, with void and refund exits.
//!
//! Orders are never deleted. Void and refund are status transitions so the
//! audit trail stays intact; settlement is the only path from open to paid
//! (see the settlement module).

use rusqlite::{params, Connection};
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::models::{now_rfc3339, Money, Order, OrderStatus};

/// Caller-provided fields for a new order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub business_id: String,
    pub branch_id: String,
    pub total: Money,
    pub created_by: String,
}

pub fn create_order(db: &DbState, new: NewOrder) -> CoreResult<Order> {
    if new.total <= 0 {
        return Err(CoreError::Validation(
            "order total must be a positive amount".into(),
        ));
    }

    let order = Order {
        id: Uuid::new_v4().to_string(),
        business_id: new.business_id,
        branch_id: new.branch_id,
        status: OrderStatus::Open,
        total: new.total,
        created_by: new.created_by,
        served_at: None,
        created_at: now_rfc3339(),
    };

    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
    conn.execute(
        "INSERT INTO orders (id, business_id, branch_id, status, total, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            order.id,
            order.business_id,
            order.branch_id,
            order.status.as_str(),
            order.total,
            order.created_by,
            order.created_at,
        ],
    )?;
    drop(conn);

    info!(order_id = %order.id, total = order.total, "order created");
    Ok(order)
}

pub fn get_order(db: &DbState, order_id: &str) -> CoreResult<Order> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
    load_order(&conn, order_id)
}

/// Open orders for a branch, oldest first.
pub fn open_orders(db: &DbState, branch_id: &str) -> CoreResult<Vec<Order>> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT * FROM orders WHERE branch_id = ?1 AND status = 'open' ORDER BY created_at ASC",
    )?;
    let orders = stmt
        .query_map(params![branch_id], Order::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(orders)
}

/// Void an open order. A paid order cannot be voided, only refunded.
pub fn void_order(db: &DbState, order_id: &str, actor_id: &str) -> CoreResult<Order> {
    transition(db, order_id, actor_id, OrderStatus::Void, OrderStatus::Open)
}

/// Refund a paid order.
pub fn refund_order(db: &DbState, order_id: &str, actor_id: &str) -> CoreResult<Order> {
    transition(db, order_id, actor_id, OrderStatus::Refunded, OrderStatus::Paid)
}

fn transition(
    db: &DbState,
    order_id: &str,
    actor_id: &str,
    to: OrderStatus,
    required_from: OrderStatus,
) -> CoreResult<Order> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;

    let affected = conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![to.as_str(), now_rfc3339(), order_id, required_from.as_str()],
    )?;

    if affected == 0 {
        // Diagnose why the guarded update matched nothing.
        let current = load_order(&conn, order_id)?;
        if current.status == to {
            return Err(CoreError::AlreadyProcessed(format!(
                "order is already {}",
                to.as_str()
            )));
        }
        return Err(CoreError::Validation(format!(
            "cannot mark a {} order as {}",
            current.status.as_str(),
            to.as_str()
        )));
    }

    let updated = load_order(&conn, order_id)?;
    drop(conn);
    info!(order_id, status = to.as_str(), actor = actor_id, "order status changed");
    Ok(updated)
}

pub(crate) fn load_order(conn: &Connection, order_id: &str) -> CoreResult<Order> {
    conn.query_row(
        "SELECT * FROM orders WHERE id = ?1",
        params![order_id],
        Order::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            CoreError::Validation(format!("order not found: {order_id}"))
        }
        other => CoreError::Db(other.to_string()),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
