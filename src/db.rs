//! Local SQLite store for the CARSS operations core.
//!
//! Uses rusqlite with WAL mode. The local database is the transactional
//! authority for the lifecycle state machine (settlement, fulfillment,
//! shift close all run as single SQLite transactions); the cloud mirror
//! is fed asynchronously through the sync queue.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Shared handle to the local database.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/carss.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("carss.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: lifecycle tables.
///
/// All money columns are INTEGER minor units. Timestamps are RFC 3339 TEXT.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- cached staff profiles from the identity backend
        CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            business_id TEXT NOT NULL,
            branch_id TEXT,
            full_name TEXT,
            role TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- orders: never deleted, void/refund are status transitions
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            business_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            total INTEGER NOT NULL,
            created_by TEXT NOT NULL,
            served_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- payment intents: pending -> confirmed | voided, terminal after that
        CREATE TABLE IF NOT EXISTS payment_intents (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            business_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            staff_id TEXT,
            shift_id TEXT,
            expected_amount INTEGER NOT NULL,
            payment_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            external_reference TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- transactions: append-only ledger; only status-transition
        -- metadata columns are ever updated in place
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            business_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            department_id TEXT,
            staff_id TEXT NOT NULL,
            shift_id TEXT,
            order_id TEXT,
            payment_intent_id TEXT,
            amount INTEGER NOT NULL,
            payment_type TEXT NOT NULL,
            payment_reference TEXT,
            status TEXT NOT NULL DEFAULT 'created',
            verified_by TEXT,
            verified_at TEXT,
            reversed_by TEXT,
            reversed_at TEXT,
            reversal_reason TEXT,
            remote_id TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- shifts: at most one open shift per staff member
        CREATE TABLE IF NOT EXISTS shifts (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            business_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            start_time TEXT NOT NULL,
            end_time TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- one row per shift-close attempt, immutable once written
        CREATE TABLE IF NOT EXISTS shift_reconciliations (
            id TEXT PRIMARY KEY,
            shift_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            business_id TEXT NOT NULL,
            expected_cash INTEGER NOT NULL,
            counted_cash INTEGER NOT NULL,
            expected_pos INTEGER NOT NULL,
            pos_machine_total INTEGER NOT NULL,
            expected_transfer INTEGER NOT NULL,
            transfer_total INTEGER NOT NULL,
            variance INTEGER NOT NULL,
            manager_approved INTEGER NOT NULL DEFAULT 0,
            manager_id TEXT,
            created_at TEXT NOT NULL
        );

        -- sync_queue (FIFO by autoincrement id; rows deleted on successful push)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER DEFAULT 0,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(business_id, status);
        CREATE INDEX IF NOT EXISTS idx_intents_order ON payment_intents(order_id, status);
        CREATE INDEX IF NOT EXISTS idx_tx_shift ON transactions(shift_id);
        CREATE INDEX IF NOT EXISTS idx_tx_business ON transactions(business_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_shifts_staff ON shifts(staff_id, status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| format!("migration v1: {e}"))?;

    info!("Migration v1 applied");
    Ok(())
}

/// Migration v2: reconciliation lookup index + fulfillment board index.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_recon_shift ON shift_reconciliations(shift_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_orders_served ON orders(branch_id, status, served_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| format!("migration v2: {e}"))?;

    info!("Migration v2 applied");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a single setting value, or `None` when absent.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a setting value.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key)
         DO UPDATE SET setting_value = ?3, updated_at = datetime('now')",
        params![category, key, value],
    )
    .map_err(|e| format!("set setting {category}/{key}: {e}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Run all migrations against an (in-memory) test connection. Panics on
/// failure; test-only.
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("test migrations");
}

/// Build an in-memory `DbState` with the full schema. Test-only.
pub fn open_in_memory_for_test() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_core_tables_exist() {
        let db = open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        for table in [
            "orders",
            "payment_intents",
            "transactions",
            "shifts",
            "shift_reconciliations",
            "sync_queue",
            "profiles",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_settings_round_trip() {
        let db = open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        assert!(get_setting(&conn, "sync", "last_cursor").is_none());
        set_setting(&conn, "sync", "last_cursor", "2026-01-01T00:00:00Z").unwrap();
        set_setting(&conn, "sync", "last_cursor", "2026-02-01T00:00:00Z").unwrap();
        assert_eq!(
            get_setting(&conn, "sync", "last_cursor").as_deref(),
            Some("2026-02-01T00:00:00Z")
        );
    }
}
