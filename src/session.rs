//! Session bootstrap and role gating.
//!
//! On startup the profile fetch retries transient failures a bounded
//! number of times with a fixed delay, then gives up with the underlying
//! error. Privileged checks fail closed: no profile, an inactive profile,
//! or a role outside the allow-list all refuse.

use rusqlite::params;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::models::Profile;

/// Startup profile fetch policy.
pub const BOOTSTRAP_ATTEMPTS: u32 = 3;
pub const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Roles allowed to take privileged actions (reversals, staff admin).
pub const PRIVILEGED_ROLES: &[&str] = &["owner", "manager"];

/// Source of staff profiles. Production is [`crate::api::BackendApi`].
#[async_trait::async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> CoreResult<Profile>;
}

/// An authenticated operator session.
#[derive(Debug, Clone)]
pub struct Session {
    pub profile: Profile,
}

impl Session {
    /// Fail-closed gate for privileged actions.
    pub fn require_role(&self, allowed: &[&str]) -> CoreResult<()> {
        if !self.profile.active {
            return Err(CoreError::Unauthorized(
                "profile is deactivated".into(),
            ));
        }
        if !allowed.contains(&self.profile.role.as_str()) {
            return Err(CoreError::Unauthorized(format!(
                "role '{}' is not permitted for this action",
                self.profile.role
            )));
        }
        Ok(())
    }

    pub fn is_privileged(&self) -> bool {
        self.require_role(PRIVILEGED_ROLES).is_ok()
    }
}

/// Fetch the operator profile with bounded retry, cache it locally, and
/// open a session. Only transient errors are retried; authorization and
/// configuration failures surface immediately.
pub async fn bootstrap<S: ProfileSource>(
    source: &S,
    db: &DbState,
    user_id: &str,
) -> CoreResult<Session> {
    let mut last_err = None;
    for attempt in 1..=BOOTSTRAP_ATTEMPTS {
        match source.fetch_profile(user_id).await {
            Ok(profile) => {
                if !profile.active {
                    return Err(CoreError::Unauthorized(
                        "profile is deactivated".into(),
                    ));
                }
                cache_profile(db, &profile)?;
                info!(user_id, role = %profile.role, "session bootstrapped");
                return Ok(Session { profile });
            }
            Err(e @ CoreError::Transient(_)) => {
                warn!(user_id, attempt, error = %e, "profile fetch failed, will retry");
                last_err = Some(e);
                if attempt < BOOTSTRAP_ATTEMPTS {
                    tokio::time::sleep(BOOTSTRAP_RETRY_DELAY).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::Transient("profile fetch failed".into())))
}

/// Upsert the fetched profile into the local cache.
fn cache_profile(db: &DbState, profile: &Profile) -> CoreResult<()> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
    conn.execute(
        "INSERT INTO profiles (id, business_id, branch_id, full_name, role, active, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
         ON CONFLICT(id) DO UPDATE SET
             business_id = ?2, branch_id = ?3, full_name = ?4, role = ?5,
             active = ?6, updated_at = datetime('now')",
        params![
            profile.id,
            profile.business_id,
            profile.branch_id,
            profile.full_name,
            profile.role,
            profile.active as i64,
        ],
    )?;
    Ok(())
}

/// Read a cached profile, for display while offline. Authorization always
/// goes through a live [`Session`], never this cache.
pub fn cached_profile(db: &DbState, user_id: &str) -> CoreResult<Option<Profile>> {
    let conn = db.conn.lock().map_err(|e| CoreError::Db(e.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT id, business_id, branch_id, full_name, role, active FROM profiles WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![user_id], |row| {
        Ok(Profile {
            id: row.get(0)?,
            business_id: row.get(1)?,
            branch_id: row.get(2)?,
            full_name: row.get(3)?,
            role: row.get(4)?,
            active: row.get::<_, i64>(5)? != 0,
        })
    })?;
    match rows.next() {
        Some(profile) => Ok(Some(profile?)),
        None => Ok(None),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
