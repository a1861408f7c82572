//! Access control
//!
//! Requests carry an optional `accessKey` query parameter (32 hex chars).
//! The master key, whose SHA-256 is stored at `['server']['masterKeyHash']`,
//! may do anything. Other keys map to an access profile through
//! `['datastore']['accessKeyHash'][H]`; requests without a key use the
//! `Anonymous` profile. Profiles allow methods and parameters and may carry
//! a rate limit per method.

use crate::error::ApiError;
use crate::rate_limiter::RateLimit;
use crate::registry::is_config_datastore;
use std::time::Duration;
use tracing::debug;
use zinc_common::checksum::{hash_secret, is_valid_access_key};
use zinc_common::config::keys;
use zinc_common::{ConfigError, DatastoreConfigSnapshot};

pub const ANONYMOUS_PROFILE: &str = "Anonymous";

/// Query parameter carrying the access key
pub const ACCESS_KEY_PARAM: &str = "accessKey";

const DEFAULT_LIMIT_INTERVAL_MS: i64 = 1000;

/// Operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMethod {
    Get,
    Post,
    Put,
    Delete,
    WebSocket,
}

impl AccessMethod {
    /// Name used in access profile paths
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::WebSocket => "WebSocket",
        }
    }
}

/// Outcome of a successful authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Access profile, `None` for the master key
    pub profile: Option<String>,
    /// Identity used for rate limiting
    pub client_id: String,
    pub limit: Option<RateLimit>,
}

impl Grant {
    #[must_use]
    pub const fn is_master(&self) -> bool {
        self.profile.is_none()
    }
}

/// Authorize `method` on `datastore`.
///
/// `params` lists the query parameter names of the request; `client` is
/// the identity used for anonymous rate limiting (typically the peer
/// address).
pub fn authorize(
    config: &DatastoreConfigSnapshot,
    datastore: &str,
    method: AccessMethod,
    access_key: Option<&str>,
    params: &[&str],
    client: &str,
) -> Result<Grant, ApiError> {
    let key_hash = match access_key {
        Some(key) if !is_valid_access_key(key) => {
            return Err(ApiError::bad_request("access key must be 32 hex characters"));
        }
        Some(key) => Some(hash_secret(key)),
        None => None,
    };

    if let Some(hash) = &key_hash
        && config
            .global()
            .get_string(keys::MASTER_KEY_HASH)
            .is_ok_and(|master| &master == hash)
    {
        return Ok(Grant {
            profile: None,
            client_id: hash.clone(),
            limit: None,
        });
    }

    if is_config_datastore(datastore) {
        return Err(if key_hash.is_some() {
            ApiError::forbidden("configuration datastores require the master key")
        } else {
            ApiError::unauthorized("configuration datastores require the master key")
        });
    }

    let profile = match &key_hash {
        Some(hash) => match config.get_string(&keys::access_key_profile(hash)) {
            Ok(profile) => profile,
            Err(ConfigError::KeyNotFound(_)) => {
                return Err(ApiError::unauthorized("unknown access key"));
            }
            Err(e) => return Err(ApiError::internal(e.to_string())),
        },
        None => ANONYMOUS_PROFILE.to_string(),
    };

    let m = method.as_str();
    if !config.bool_or(&keys::method_allowed(&profile, m), false) {
        debug!("Profile {profile} may not {m} {datastore}");
        return Err(ApiError::method_not_allowed(format!(
            "{m} is not allowed for this access key"
        )));
    }

    if let Some(param) = params
        .iter()
        .filter(|p| **p != ACCESS_KEY_PARAM)
        .find(|p| !config.bool_or(&keys::param_allowed(&profile, m, p), true))
    {
        return Err(ApiError::forbidden(format!(
            "parameter {param} is not allowed for this access key"
        )));
    }

    let limit = config
        .get_int64(&keys::method_limit_requests(&profile, m))
        .ok()
        .and_then(|requests| u64::try_from(requests).ok())
        .map(|requests| {
            let interval_ms = config
                .int64_or(
                    &keys::method_limit_interval(&profile, m),
                    DEFAULT_LIMIT_INTERVAL_MS,
                )
                .max(1);
            RateLimit {
                requests,
                interval: Duration::from_millis(interval_ms.unsigned_abs()),
            }
        });

    Ok(Grant {
        profile: Some(profile),
        client_id: key_hash.unwrap_or_else(|| client.to_string()),
        limit,
    })
}
