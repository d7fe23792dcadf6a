//! Typed entities for the lifecycle core.
//!
//! The cloud mirror returns loosely-typed JSON rows; everything is parsed
//! into these structs at the boundary and rejected with a decode error
//! instead of letting untyped data flow inward. Amounts are integer minor
//! units so reconciliation arithmetic is exact.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Money in minor units (kobo / cents).
pub type Money = i64;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Paid,
    Void,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Paid => "paid",
            OrderStatus::Void => "void",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "paid" => Ok(OrderStatus::Paid),
            "void" => Ok(OrderStatus::Void),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(CoreError::Decode(format!("unknown order status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Pos,
    Transfer,
    Card,
    Wallet,
    BillToRoom,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Pos => "pos",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Card => "card",
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::BillToRoom => "bill_to_room",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "pos" => Ok(PaymentMethod::Pos),
            "transfer" => Ok(PaymentMethod::Transfer),
            "card" => Ok(PaymentMethod::Card),
            "wallet" => Ok(PaymentMethod::Wallet),
            "bill_to_room" => Ok(PaymentMethod::BillToRoom),
            other => Err(CoreError::Decode(format!("unknown payment method: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Confirmed,
    Voided,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Confirmed => "confirmed",
            IntentStatus::Voided => "voided",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "confirmed" => Ok(IntentStatus::Confirmed),
            "voided" => Ok(IntentStatus::Voided),
            other => Err(CoreError::Decode(format!("unknown intent status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Created,
    Verified,
    Reversed,
    Disputed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "created",
            TransactionStatus::Verified => "verified",
            TransactionStatus::Reversed => "reversed",
            TransactionStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "created" => Ok(TransactionStatus::Created),
            "verified" => Ok(TransactionStatus::Verified),
            "reversed" => Ok(TransactionStatus::Reversed),
            "disputed" => Ok(TransactionStatus::Disputed),
            other => Err(CoreError::Decode(format!(
                "unknown transaction status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftStatus {
    Open,
    Closed,
}

impl ShiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftStatus::Open => "open",
            ShiftStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "open" => Ok(ShiftStatus::Open),
            "closed" => Ok(ShiftStatus::Closed),
            other => Err(CoreError::Decode(format!("unknown shift status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub business_id: String,
    pub branch_id: String,
    pub status: OrderStatus,
    pub total: Money,
    pub created_by: String,
    pub served_at: Option<String>,
    pub created_at: String,
}

impl Order {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get("id")?,
            business_id: row.get("business_id")?,
            branch_id: row.get("branch_id")?,
            status: OrderStatus::parse(&row.get::<_, String>("status")?)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            total: row.get("total")?,
            created_by: row.get("created_by")?,
            served_at: row.get("served_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub order_id: String,
    pub business_id: String,
    pub branch_id: String,
    pub staff_id: Option<String>,
    pub shift_id: Option<String>,
    pub expected_amount: Money,
    pub payment_type: PaymentMethod,
    pub status: IntentStatus,
    pub external_reference: Option<String>,
    pub created_at: String,
}

impl PaymentIntent {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(PaymentIntent {
            id: row.get("id")?,
            order_id: row.get("order_id")?,
            business_id: row.get("business_id")?,
            branch_id: row.get("branch_id")?,
            staff_id: row.get("staff_id")?,
            shift_id: row.get("shift_id")?,
            expected_amount: row.get("expected_amount")?,
            payment_type: PaymentMethod::parse(&row.get::<_, String>("payment_type")?)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            status: IntentStatus::parse(&row.get::<_, String>("status")?)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            external_reference: row.get("external_reference")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Append-only ledger row. Status transitions only touch the
/// actor/timestamp metadata columns, never the financial fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub business_id: String,
    pub branch_id: String,
    pub department_id: Option<String>,
    pub staff_id: String,
    pub shift_id: Option<String>,
    pub order_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount: Money,
    pub payment_type: PaymentMethod,
    pub payment_reference: Option<String>,
    pub status: TransactionStatus,
    pub verified_by: Option<String>,
    pub verified_at: Option<String>,
    pub reversed_by: Option<String>,
    pub reversed_at: Option<String>,
    pub reversal_reason: Option<String>,
    pub remote_id: Option<String>,
    pub created_at: String,
}

impl Transaction {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Transaction {
            id: row.get("id")?,
            business_id: row.get("business_id")?,
            branch_id: row.get("branch_id")?,
            department_id: row.get("department_id")?,
            staff_id: row.get("staff_id")?,
            shift_id: row.get("shift_id")?,
            order_id: row.get("order_id")?,
            payment_intent_id: row.get("payment_intent_id")?,
            amount: row.get("amount")?,
            payment_type: PaymentMethod::parse(&row.get::<_, String>("payment_type")?)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            payment_reference: row.get("payment_reference")?,
            status: TransactionStatus::parse(&row.get::<_, String>("status")?)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            verified_by: row.get("verified_by")?,
            verified_at: row.get("verified_at")?,
            reversed_by: row.get("reversed_by")?,
            reversed_at: row.get("reversed_at")?,
            reversal_reason: row.get("reversal_reason")?,
            remote_id: row.get("remote_id")?,
            created_at: row.get("created_at")?,
        })
    }

    /// Payload shape the cloud mirror accepts.
    pub fn to_remote_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "business_id": self.business_id,
            "branch_id": self.branch_id,
            "department_id": self.department_id,
            "staff_id": self.staff_id,
            "shift_id": self.shift_id,
            "order_id": self.order_id,
            "payment_intent_id": self.payment_intent_id,
            "amount": self.amount,
            "payment_type": self.payment_type.as_str(),
            "payment_reference": self.payment_reference,
            "status": self.status.as_str(),
            "created_at": self.created_at,
        })
    }
}

/// Fields a caller provides when recording a transaction. Identity,
/// status, and timestamps are assigned by the ledger.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub business_id: String,
    pub branch_id: String,
    pub department_id: Option<String>,
    pub staff_id: String,
    pub shift_id: Option<String>,
    pub order_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub amount: Money,
    pub payment_type: PaymentMethod,
    pub payment_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
    pub id: String,
    pub staff_id: String,
    pub business_id: String,
    pub branch_id: String,
    pub status: ShiftStatus,
    pub start_time: String,
    pub end_time: Option<String>,
}

impl Shift {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Shift {
            id: row.get("id")?,
            staff_id: row.get("staff_id")?,
            business_id: row.get("business_id")?,
            branch_id: row.get("branch_id")?,
            status: ShiftStatus::parse(&row.get::<_, String>("status")?)
                .map_err(|_| rusqlite::Error::InvalidQuery)?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
        })
    }
}

/// Immutable record of one shift-close attempt. Multiple rows can exist
/// for a shift that repeatedly failed to reconcile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftReconciliation {
    pub id: String,
    pub shift_id: String,
    pub staff_id: String,
    pub business_id: String,
    pub expected_cash: Money,
    pub counted_cash: Money,
    pub expected_pos: Money,
    pub pos_machine_total: Money,
    pub expected_transfer: Money,
    pub transfer_total: Money,
    pub variance: Money,
    pub manager_approved: bool,
    pub manager_id: Option<String>,
    pub created_at: String,
}

impl ShiftReconciliation {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ShiftReconciliation {
            id: row.get("id")?,
            shift_id: row.get("shift_id")?,
            staff_id: row.get("staff_id")?,
            business_id: row.get("business_id")?,
            expected_cash: row.get("expected_cash")?,
            counted_cash: row.get("counted_cash")?,
            expected_pos: row.get("expected_pos")?,
            pos_machine_total: row.get("pos_machine_total")?,
            expected_transfer: row.get("expected_transfer")?,
            transfer_total: row.get("transfer_total")?,
            variance: row.get("variance")?,
            manager_approved: row.get::<_, i64>("manager_approved")? != 0,
            manager_id: row.get("manager_id")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Staff profile as returned by the identity backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub business_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Decode(format!("bad timestamp {s}: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_method_round_trip() {
        for m in [
            PaymentMethod::Cash,
            PaymentMethod::Pos,
            PaymentMethod::Transfer,
            PaymentMethod::Card,
            PaymentMethod::Wallet,
            PaymentMethod::BillToRoom,
        ] {
            assert_eq!(PaymentMethod::parse(m.as_str()).unwrap(), m);
        }
        assert!(matches!(
            PaymentMethod::parse("cheque"),
            Err(CoreError::Decode(_))
        ));
    }

    #[test]
    fn test_order_status_parse_rejects_unknown() {
        assert!(OrderStatus::parse("paid").is_ok());
        assert!(OrderStatus::parse("PAID").is_err());
        assert!(OrderStatus::parse("").is_err());
    }

    #[test]
    fn test_profile_decodes_loose_remote_json() {
        let p: Profile = serde_json::from_str(
            r#"{"id":"u1","business_id":"b1","role":"manager","unknown_field":42}"#,
        )
        .unwrap();
        assert_eq!(p.id, "u1");
        assert!(p.active, "active defaults to true");
        assert!(p.branch_id.is_none());
    }

    #[test]
    fn test_remote_payload_omits_local_identity() {
        let tx = Transaction {
            id: "local-1".into(),
            business_id: "b1".into(),
            branch_id: "br1".into(),
            department_id: None,
            staff_id: "s1".into(),
            shift_id: None,
            order_id: None,
            payment_intent_id: None,
            amount: 7500,
            payment_type: PaymentMethod::Cash,
            payment_reference: None,
            status: TransactionStatus::Created,
            verified_by: None,
            verified_at: None,
            reversed_by: None,
            reversed_at: None,
            reversal_reason: None,
            remote_id: None,
            created_at: now_rfc3339(),
        };
        let payload = tx.to_remote_payload();
        assert!(payload.get("id").is_none(), "remote assigns identity");
        assert_eq!(payload["amount"], 7500);
        assert_eq!(payload["payment_type"], "cash");
    }
}
