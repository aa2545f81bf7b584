//! Configuration loading and representation.
//!
//! Everything is read from environment variables with defaults suitable for
//! local development. [`AppConfig::from_lookup`] takes the lookup as a closure
//! so tests can supply values without touching the process environment.

use std::time::Duration;

use thiserror::Error;
use tryon_core::QuotaConfig;

use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Object store endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobConfig {
    /// Management API used for put/list/delete.
    pub api_url: String,
    /// Public origin every stored object URL starts with.
    pub public_url: String,
    pub token: Option<String>,
}

/// Image composition service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Limits and budgets on the request path.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub max_upload_bytes: usize,
    /// How long a submit call waits for processing before answering `PROCESSING`.
    pub processing_budget: Duration,
    pub fetch_retry: RetryPolicy,
    pub fetch_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 1024 * 1024,
            processing_budget: Duration::from_secs(55),
            fetch_retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Batch sizes and pacing for background jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub cleanup_batch_size: usize,
    pub orphan_batch_size: usize,
    pub batch_delay: Duration,
    /// Extra wait after a failed orphan batch.
    pub error_backoff: Duration,
    pub list_page_size: usize,
    pub backfill_page_size: usize,
    /// Path prefixes owned by this service, including legacy ones.
    pub managed_prefixes: Vec<String>,
    /// PROCESSING tasks older than this are re-driven by the resume job.
    pub stale_after: Duration,
    /// Unreferenced objects younger than this are left alone; they may belong
    /// to a submission that has uploaded but not yet created its task.
    pub min_orphan_age: Duration,
    pub preview_samples: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_batch_size: 100,
            orphan_batch_size: 50,
            batch_delay: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
            list_page_size: 1000,
            backfill_page_size: 500,
            managed_prefixes: vec!["tryon/".to_string(), "try-on/".to_string()],
            stale_after: Duration::from_secs(15 * 60),
            min_orphan_age: Duration::from_secs(60 * 60),
            preview_samples: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// `None` selects in-memory stores.
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub jwt_secret: Option<String>,
    pub blob: BlobConfig,
    pub composer: ComposerConfig,
    pub quotas: QuotaConfig,
    pub request: RequestConfig,
    pub maintenance: MaintenanceConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let defaults = QuotaConfig::default();
        let quotas = QuotaConfig {
            free_trial_limit: parse_or(&lookup, "FREE_TRIAL_LIMIT", defaults.free_trial_limit)?,
            monthly_quota: parse_or(&lookup, "MONTHLY_QUOTA", defaults.monthly_quota)?,
            yearly_quota: parse_or(&lookup, "YEARLY_QUOTA", defaults.yearly_quota)?,
            credits_pack: parse_or(&lookup, "CREDITS_PACK_AMOUNT", defaults.credits_pack)?,
        };

        let request_defaults = RequestConfig::default();
        let request = RequestConfig {
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", request_defaults.max_upload_bytes)?,
            processing_budget: Duration::from_secs(parse_or(
                &lookup,
                "PROCESSING_BUDGET_SECS",
                request_defaults.processing_budget.as_secs(),
            )?),
            ..request_defaults
        };

        let public_url = get("BLOB_PUBLIC_URL")
            .unwrap_or_else(|| "http://localhost:9000/blobs".to_string());

        Ok(Self {
            database_url: get("DATABASE_URL"),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            jwt_secret: get("JWT_SECRET"),
            blob: BlobConfig {
                api_url: get("BLOB_API_URL").unwrap_or_else(|| public_url.clone()),
                public_url: public_url.trim_end_matches('/').to_string(),
                token: get("BLOB_API_TOKEN"),
            },
            composer: ComposerConfig {
                url: get("COMPOSER_URL").unwrap_or_else(|| "http://localhost:9100/v1/compose".to_string()),
                api_key: get("COMPOSER_API_KEY"),
                timeout: Duration::from_secs(parse_or(&lookup, "COMPOSER_TIMEOUT_SECS", 120u64)?),
            },
            quotas,
            request,
            maintenance: MaintenanceConfig::default(),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_product_limits() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.quotas, QuotaConfig::default());
        assert_eq!(cfg.request.max_upload_bytes, 1024 * 1024);
        assert_eq!(cfg.maintenance.cleanup_batch_size, 100);
        assert_eq!(cfg.maintenance.orphan_batch_size, 50);
        assert_eq!(cfg.maintenance.managed_prefixes, vec!["tryon/", "try-on/"]);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("MONTHLY_QUOTA", "120"),
            ("DATABASE_URL", "postgres://localhost/tryon"),
            ("BLOB_PUBLIC_URL", "https://cdn.example.com/"),
        ])
        .unwrap();
        assert_eq!(cfg.quotas.monthly_quota, 120);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/tryon"));
        assert_eq!(cfg.blob.public_url, "https://cdn.example.com");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config(&[("YEARLY_QUOTA", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "YEARLY_QUOTA", .. }));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = config(&[("DATABASE_URL", "  "), ("FREE_TRIAL_LIMIT", "")]).unwrap();
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.quotas.free_trial_limit, 1);
    }
}
