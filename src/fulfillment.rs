//! Fulfillment gate: hand an order to the guest exactly once.
//!
//! The serve operation is a compare-and-swap on the orders table. The
//! guarded UPDATE only matches a paid, not-yet-served row, so two waiters
//! racing on the same order resolve inside SQLite and exactly one wins.

use rusqlite::params;
use tracing::info;

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::models::{now_rfc3339, Order};
use crate::orders::load_order;

/// Mark an order as served. Succeeds at most once per order.
pub fn serve_order(db: &DbState, order_id: &str, staff_id: &str) -> CoreResult<Order> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;

    let served_at = now_rfc3339();
    let affected = conn.execute(
        "UPDATE orders SET served_at = ?1, updated_at = ?1
         WHERE id = ?2 AND status = 'paid' AND served_at IS NULL",
        params![served_at, order_id],
    )?;

    if affected == 0 {
        // The swap lost. Read the row back to report the precise reason.
        let current = load_order(&conn, order_id)?;
        if current.served_at.is_some() {
            return Err(CoreError::AlreadyProcessed(
                "order has already been served".into(),
            ));
        }
        return Err(CoreError::Validation(format!(
            "only paid orders can be served (order is {})",
            current.status.as_str()
        )));
    }

    let updated = load_order(&conn, order_id)?;
    drop(conn);
    info!(order_id, staff = staff_id, "order served");
    Ok(updated)
}

/// Paid orders awaiting fulfillment, oldest first.
pub fn ready_orders(db: &DbState, branch_id: &str) -> CoreResult<Vec<Order>> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT * FROM orders
         WHERE branch_id = ?1 AND status = 'paid' AND served_at IS NULL
         ORDER BY created_at ASC",
    )?;
    let orders = stmt
        .query_map(params![branch_id], Order::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(orders)
}

/// Most recently served orders for the fulfillment board.
pub fn recently_served(db: &DbState, branch_id: &str, limit: u32) -> CoreResult<Vec<Order>> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT * FROM orders
         WHERE branch_id = ?1 AND served_at IS NOT NULL
         ORDER BY served_at DESC LIMIT ?2",
    )?;
    let orders = stmt
        .query_map(params![branch_id, limit], Order::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(orders)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::orders::{create_order, NewOrder};
    use std::sync::Arc;
    use std::thread;

    fn paid_order(db: &DbState, total: i64) -> Order {
        let order = create_order(
            db,
            NewOrder {
                business_id: "biz-1".into(),
                branch_id: "br-1".into(),
                total,
                created_by: "staff-1".into(),
            },
        )
        .unwrap();
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "UPDATE orders SET status = 'paid' WHERE id = ?1",
            params![order.id],
        )
        .unwrap();
        drop(conn);
        order
    }

    #[test]
    fn test_serve_succeeds_exactly_once() {
        let db = db::open_in_memory_for_test();
        let order = paid_order(&db, 7500);

        let served = serve_order(&db, &order.id, "waiter-1").unwrap();
        assert!(served.served_at.is_some());

        let err = serve_order(&db, &order.id, "waiter-2").unwrap_err();
        assert!(matches!(err, CoreError::AlreadyProcessed(_)));

        // First writer's timestamp survives.
        let after = crate::orders::get_order(&db, &order.id).unwrap();
        assert_eq!(after.served_at, served.served_at);
    }

    #[test]
    fn test_serve_rejects_unpaid_order() {
        let db = db::open_in_memory_for_test();
        let order = create_order(
            &db,
            NewOrder {
                business_id: "biz-1".into(),
                branch_id: "br-1".into(),
                total: 500,
                created_by: "staff-1".into(),
            },
        )
        .unwrap();

        let err = serve_order(&db, &order.id, "waiter-1").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_serve_rejects_unknown_order() {
        let db = db::open_in_memory_for_test();
        let err = serve_order(&db, "no-such-order", "waiter-1").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_concurrent_serves_have_one_winner() {
        let db = Arc::new(db::open_in_memory_for_test());
        let order = paid_order(&db, 7500);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let db = Arc::clone(&db);
                let order_id = order.id.clone();
                thread::spawn(move || serve_order(&db, &order_id, &format!("waiter-{i}")).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(wins, 1, "exactly one serve must win the race");
    }

    #[test]
    fn test_ready_board_ordering() {
        let db = db::open_in_memory_for_test();
        let first = paid_order(&db, 100);
        let second = paid_order(&db, 200);

        let ready = ready_orders(&db, "br-1").unwrap();
        assert_eq!(
            ready.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(),
            vec![first.id.as_str(), second.id.as_str()]
        );

        serve_order(&db, &first.id, "waiter-1").unwrap();
        let ready = ready_orders(&db, "br-1").unwrap();
        assert_eq!(ready.len(), 1);
        let served = recently_served(&db, "br-1", 10).unwrap();
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].id, first.id);
    }
}
