//! Secure backend-credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Holds the cloud backend URL, the
//! service API key, and the tenant identity of this installation.

use keyring::Entry;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

const SERVICE_NAME: &str = "carss-core";

// Credential keys
pub const KEY_BACKEND_URL: &str = "backend_url";
pub const KEY_API_KEY: &str = "service_api_key";
pub const KEY_BUSINESS_ID: &str = "business_id";
pub const KEY_BRANCH_ID: &str = "branch_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_BUSINESS_ID, KEY_BRANCH_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> CoreResult<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| CoreError::Config(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| CoreError::Config(e.to_string()))?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> CoreResult<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| CoreError::Config(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(CoreError::Config(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Backend connection credentials for this installation.
#[derive(Debug, Clone)]
pub struct BackendCredentials {
    pub backend_url: String,
    pub api_key: String,
    pub business_id: String,
    pub branch_id: Option<String>,
}

/// The installation is considered configured when the backend URL, API key,
/// and business id are all present in the credential store.
pub fn is_configured() -> bool {
    get_credential(KEY_BACKEND_URL).is_some()
        && get_credential(KEY_API_KEY).is_some()
        && get_credential(KEY_BUSINESS_ID).is_some()
}

/// Load the stored credentials, failing with a configuration error when any
/// mandatory entry is missing. This is the fatal, non-retried path: callers
/// surface it to the operator rather than looping.
pub fn load_credentials() -> CoreResult<BackendCredentials> {
    let backend_url = get_credential(KEY_BACKEND_URL)
        .ok_or_else(|| CoreError::Config("missing backend URL credential".into()))?;
    let api_key = get_credential(KEY_API_KEY)
        .ok_or_else(|| CoreError::Config("missing service API key credential".into()))?;
    let business_id = get_credential(KEY_BUSINESS_ID)
        .ok_or_else(|| CoreError::Config("missing business id credential".into()))?;
    let branch_id = get_credential(KEY_BRANCH_ID);

    Ok(BackendCredentials {
        backend_url,
        api_key,
        business_id,
        branch_id,
    })
}

/// Store credentials received during onboarding. The API key may arrive as a
/// connection string (base64 JSON bundling key, url, and tenant ids), in
/// which case the bundled values win over the individual fields.
pub fn update_credentials(
    raw_api_key: &str,
    backend_url: Option<&str>,
    business_id: Option<&str>,
    branch_id: Option<&str>,
) -> CoreResult<()> {
    let mut api_key = raw_api_key.trim().to_string();
    let mut backend_url = backend_url.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let mut business_id = business_id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    if let Some(decoded_key) = crate::api::extract_api_key_from_connection_string(raw_api_key) {
        api_key = decoded_key;
        if let Some(decoded_url) =
            crate::api::extract_backend_url_from_connection_string(raw_api_key)
        {
            backend_url = Some(decoded_url);
        }
        if let Some(decoded_bid) =
            crate::api::extract_business_id_from_connection_string(raw_api_key)
        {
            business_id = Some(decoded_bid);
        }
    }

    if api_key.is_empty() {
        return Err(CoreError::Validation("Missing required field: apiKey".into()));
    }
    let business_id = business_id
        .ok_or_else(|| CoreError::Validation("Missing required field: businessId".into()))?;

    set_credential(KEY_API_KEY, &api_key)?;
    set_credential(KEY_BUSINESS_ID, &business_id)?;

    if let Some(url) = backend_url.as_deref() {
        let normalized = crate::api::normalize_backend_url(url);
        if !normalized.is_empty() {
            set_credential(KEY_BACKEND_URL, &normalized)?;
        }
    }
    if let Some(bid) = branch_id {
        set_credential(KEY_BRANCH_ID, bid)?;
    }

    info!(business_id = %business_id, "backend credentials updated");
    Ok(())
}

/// Delete every stored credential (deprovisioning / factory reset).
pub fn factory_reset() -> CoreResult<()> {
    info!("deleting all stored backend credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
