use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::external::{HttpSecurityConfig, RetryConfig};
use crate::issues::{AggregatorPolicy, LifecycleConfig};
use crate::ledger::{LedgerPolicy, TokenAmount};
use crate::reputation::{LevelCurve, XpSchedule};

/// Service configuration, loaded from `CIVIC_*` environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CivicConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub classifier: CollaboratorConfig,
    pub signer: CollaboratorConfig,
    pub aggregator: AggregatorPolicy,
    pub reputation: ReputationConfig,
    pub ledger: LedgerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host to bind to
    pub host: String,
    /// Server port to bind to
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Require HTTPS for collaborator URLs
    pub require_https: bool,
    /// Verify TLS certificates
    pub verify_certificates: bool,
    /// Maximum request body size in bytes
    pub max_request_size: usize,
    /// Maximum collaborator response size in bytes
    pub max_response_size: usize,
}

/// An external HTTP collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// Base URL. Unset disables the collaborator.
    pub url: Option<String>,
    /// Bearer token sent with each request
    pub api_token: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    pub schedule: XpSchedule,
    pub level_curve: LevelCurve,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Tokens credited per point converted
    pub conversion_rate: TokenAmount,
    /// Seconds between background passes over PENDING withdrawals
    pub reconcile_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub postgres_url: String,
    /// Enable PostgreSQL (if false, state lives in memory only)
    pub postgres_enabled: bool,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Enable request/response logging
    pub log_requests: bool,
}

impl Default for CivicConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8780,
            },
            security: SecurityConfig {
                require_https: true,
                verify_certificates: true,
                max_request_size: 10 * 1024 * 1024, // image uploads
                max_response_size: 1024 * 1024,
            },
            classifier: CollaboratorConfig {
                url: None,
                api_token: None,
                timeout_secs: 15,
                max_attempts: 2,
            },
            signer: CollaboratorConfig {
                url: None,
                api_token: None,
                timeout_secs: 10,
                max_attempts: 3,
            },
            aggregator: AggregatorPolicy::default(),
            reputation: ReputationConfig {
                schedule: XpSchedule::default(),
                level_curve: LevelCurve::default(),
            },
            ledger: LedgerConfig {
                conversion_rate: TokenAmount::from_micros(100_000),
                reconcile_interval_secs: 60,
            },
            database: DatabaseConfig {
                postgres_url: "postgresql://localhost:5432/civic_ledger".to_string(),
                postgres_enabled: false,
                max_connections: 10,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_requests: true,
            },
        }
    }
}

/// Parse `name` if set
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {} value", name)),
        Err(_) => Ok(None),
    }
}

impl CivicConfig {
    /// Load configuration from environment variables over defaults, then validate
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Server
        if let Ok(host) = env::var("CIVIC_HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_parse("CIVIC_PORT")? {
            config.server.port = port;
        }

        // Security
        if let Some(require_https) = env_parse("CIVIC_REQUIRE_HTTPS")? {
            config.security.require_https = require_https;
        }
        if let Some(verify) = env_parse("CIVIC_VERIFY_CERTIFICATES")? {
            config.security.verify_certificates = verify;
        }
        if let Some(size) = env_parse("CIVIC_MAX_REQUEST_SIZE")? {
            config.security.max_request_size = size;
        }

        // Collaborators
        config.classifier.url = env::var("CIVIC_CLASSIFIER_URL").ok();
        config.classifier.api_token = env::var("CIVIC_CLASSIFIER_API_TOKEN").ok();
        if let Some(timeout) = env_parse("CIVIC_CLASSIFIER_TIMEOUT_SECS")? {
            config.classifier.timeout_secs = timeout;
        }
        if let Some(attempts) = env_parse("CIVIC_CLASSIFIER_MAX_ATTEMPTS")? {
            config.classifier.max_attempts = attempts;
        }

        config.signer.url = env::var("CIVIC_SIGNER_URL").ok();
        config.signer.api_token = env::var("CIVIC_SIGNER_API_TOKEN").ok();
        if let Some(timeout) = env_parse("CIVIC_SIGNER_TIMEOUT_SECS")? {
            config.signer.timeout_secs = timeout;
        }
        if let Some(attempts) = env_parse("CIVIC_SIGNER_MAX_ATTEMPTS")? {
            config.signer.max_attempts = attempts;
        }

        // Aggregator policy
        if let Some(min_votes) = env_parse("CIVIC_AGGREGATOR_MIN_VOTES")? {
            config.aggregator.min_votes = min_votes;
        }
        if let Some(weight) = env_parse("CIVIC_AGGREGATOR_AI_WEIGHT")? {
            config.aggregator.ai_weight = weight;
        }
        if let Some(weight) = env_parse("CIVIC_AGGREGATOR_VOTE_WEIGHT")? {
            config.aggregator.vote_weight = weight;
        }
        if let Some(threshold) = env_parse("CIVIC_AGGREGATOR_VERIFY_THRESHOLD")? {
            config.aggregator.verify_threshold = threshold;
        }
        if let Some(threshold) = env_parse("CIVIC_AGGREGATOR_REJECT_THRESHOLD")? {
            config.aggregator.reject_threshold = threshold;
        }
        if let Some(confidence) = env_parse("CIVIC_AGGREGATOR_FAST_PATH_CONFIDENCE")? {
            config.aggregator.fast_path_confidence = confidence;
        }

        // Reputation
        if let Some(xp) = env_parse("CIVIC_XP_SUBMIT")? {
            config.reputation.schedule.submit = xp;
        }
        if let Some(xp) = env_parse("CIVIC_XP_VERIFIED")? {
            config.reputation.schedule.verified = xp;
        }
        if let Some(xp) = env_parse("CIVIC_XP_VERIFIED_AI_FAST_PATH")? {
            config.reputation.schedule.verified_ai_fast_path = xp;
        }
        if let Some(xp) = env_parse("CIVIC_XP_UPVOTE_RECEIVED")? {
            config.reputation.schedule.upvote_received = xp;
        }
        if let Some(curve) = env_parse("CIVIC_LEVEL_CURVE")? {
            config.reputation.level_curve = curve;
        }

        // Ledger
        if let Some(rate) = env_parse("CIVIC_CONVERSION_RATE")? {
            config.ledger.conversion_rate = rate;
        }
        if let Some(interval) = env_parse("CIVIC_RECONCILE_INTERVAL_SECS")? {
            config.ledger.reconcile_interval_secs = interval;
        }

        // Database
        if let Ok(url) = env::var("CIVIC_POSTGRES_URL") {
            config.database.postgres_url = url;
        }
        if let Some(enabled) = env_parse("CIVIC_POSTGRES_ENABLED")? {
            config.database.postgres_enabled = enabled;
        }
        if let Some(max) = env_parse("CIVIC_POSTGRES_MAX_CONNECTIONS")? {
            config.database.max_connections = max;
        }

        // Logging
        if let Ok(level) = env::var("CIVIC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(log_requests) = env_parse("CIVIC_LOG_REQUESTS")? {
            config.logging.log_requests = log_requests;
        }

        config.validate()?;

        info!(
            classifier = %config.classifier.url.as_deref().unwrap_or("<disabled>"),
            classifier_token = %config.classifier.api_token.as_deref().map(mask_secret).unwrap_or_else(|| "<none>".to_string()),
            signer = %config.signer.url.as_deref().unwrap_or("<disabled>"),
            signer_token = %config.signer.api_token.as_deref().map(mask_secret).unwrap_or_else(|| "<none>".to_string()),
            postgres = %sanitize_for_logging(&config.database.postgres_url),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Validate configuration for security and consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port must be non-zero"));
        }

        for (name, collaborator) in [("classifier", &self.classifier), ("signer", &self.signer)] {
            if let Some(ref url) = collaborator.url {
                if url.is_empty() {
                    return Err(anyhow::anyhow!("{} URL cannot be empty", name));
                }
                if self.security.require_https && !url.starts_with("https://") {
                    return Err(anyhow::anyhow!(
                        "HTTPS is required but {} URL is not HTTPS: {}",
                        name,
                        url
                    ));
                }
            }
            if collaborator.timeout_secs == 0 {
                return Err(anyhow::anyhow!("{} timeout must be non-zero", name));
            }
            if collaborator.max_attempts == 0 {
                return Err(anyhow::anyhow!("{} max attempts must be at least 1", name));
            }
        }

        self.aggregator
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid aggregator policy: {}", e))?;
        self.reputation
            .level_curve
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid level curve: {}", e))?;

        if !self.ledger.conversion_rate.is_positive() {
            return Err(anyhow::anyhow!(
                "Conversion rate must be positive, got {}",
                self.ledger.conversion_rate
            ));
        }
        if self.ledger.reconcile_interval_secs == 0 {
            return Err(anyhow::anyhow!("Reconcile interval must be non-zero"));
        }

        if self.database.postgres_enabled && self.database.postgres_url.is_empty() {
            return Err(anyhow::anyhow!(
                "PostgreSQL is enabled but CIVIC_POSTGRES_URL is empty"
            ));
        }

        if self.signer.url.is_none() {
            warn!("CIVIC_SIGNER_URL not set, withdrawals will stay PENDING until a signer is configured");
        }

        Ok(())
    }

    pub fn http_security(&self, collaborator: &CollaboratorConfig) -> HttpSecurityConfig {
        HttpSecurityConfig {
            require_https: self.security.require_https,
            verify_certificates: self.security.verify_certificates,
            timeout_secs: collaborator.timeout_secs,
            max_response_size: self.security.max_response_size,
            allowed_hosts: Vec::new(),
        }
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            policy: self.aggregator.clone(),
            classifier_timeout: Duration::from_secs(self.classifier.timeout_secs),
            classifier_retry: RetryConfig {
                max_attempts: self.classifier.max_attempts,
                ..Default::default()
            },
        }
    }

    pub fn ledger_policy(&self) -> LedgerPolicy {
        LedgerPolicy {
            conversion_rate: self.ledger.conversion_rate,
            signer_timeout: Duration::from_secs(self.signer.timeout_secs),
            signer_retry: RetryConfig {
                max_attempts: self.signer.max_attempts,
                ..Default::default()
            },
        }
    }
}

/// Mask a secret, keeping only its ends
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

/// Sanitize sensitive data for logging
///
/// Connection strings lose their password; anything that looks like a
/// credential is masked.
pub fn sanitize_for_logging(data: &str) -> String {
    if let Ok(mut url) = url::Url::parse(data)
        && url.password().is_some()
    {
        let _ = url.set_password(Some("***"));
        return url.to_string();
    }

    let sensitive_patterns = ["auth", "key", "token", "password", "secret", "credential", "bearer"];
    let data_lower = data.to_lowercase();
    if sensitive_patterns.iter().any(|p| data_lower.contains(p)) {
        return mask_secret(data);
    }

    data.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(mask_secret("sk_live_1234567890"), "sk_l...7890");
    }

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(
            sanitize_for_logging("postgresql://civic:hunter2@db:5432/civic"),
            "postgresql://civic:***@db:5432/civic"
        );
        assert_eq!(sanitize_for_logging("api_key_secret"), "api_...cret");
        assert_eq!(sanitize_for_logging("normal_data"), "normal_data");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(CivicConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CivicConfig::default();
        config.signer.url = Some("http://signer.internal".to_string());
        assert!(config.validate().is_err());

        config.security.require_https = false;
        assert!(config.validate().is_ok());

        config.aggregator.ai_weight = 0.9;
        assert!(config.validate().is_err());

        let mut config = CivicConfig::default();
        config.ledger.conversion_rate = TokenAmount::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_policies() {
        let config = CivicConfig::default();
        let ledger = config.ledger_policy();
        assert_eq!(ledger.conversion_rate, TokenAmount::from_micros(100_000));
        assert_eq!(ledger.signer_retry.max_attempts, 3);
        assert_eq!(config.lifecycle().classifier_timeout, Duration::from_secs(15));
    }
}
