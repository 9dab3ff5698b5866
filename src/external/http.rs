use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::ExternalError;

/// Transport requirements for collaborator calls
#[derive(Debug, Clone)]
pub struct HttpSecurityConfig {
    /// Require HTTPS for all external communications
    pub require_https: bool,
    /// Verify TLS certificates
    pub verify_certificates: bool,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum response size in bytes
    pub max_response_size: usize,
    /// Hosts collaborators may live on. Empty allows any host.
    pub allowed_hosts: Vec<String>,
}

impl Default for HttpSecurityConfig {
    fn default() -> Self {
        Self {
            require_https: true,
            verify_certificates: true,
            timeout_secs: 10,
            max_response_size: 1024 * 1024, // 1MB max
            allowed_hosts: Vec::new(),
        }
    }
}

/// HTTP client shared by the classifier and signer clients
#[derive(Clone)]
pub struct SecureHttpClient {
    client: Client,
    config: HttpSecurityConfig,
}

impl SecureHttpClient {
    pub fn new(config: HttpSecurityConfig) -> Result<Self> {
        let mut client_builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("civic-ledger/", env!("CARGO_PKG_VERSION")));

        if config.require_https {
            client_builder = client_builder.https_only(true);
            info!("HTTPS enforcement enabled for collaborator calls");
        }

        if !config.verify_certificates {
            warn!("TLS certificate verification disabled - this is insecure!");
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let client = client_builder
            .build()
            .context("Failed to create collaborator HTTP client")?;

        Ok(Self { client, config })
    }

    /// Validate a collaborator base URL
    pub fn validate_url(&self, url: &str) -> Result<Url> {
        let parsed_url = Url::parse(url).context("Invalid URL format")?;

        if self.config.require_https && parsed_url.scheme() != "https" {
            return Err(anyhow::anyhow!(
                "HTTPS is required but URL uses {}: {}",
                parsed_url.scheme(),
                url
            ));
        }

        let host = parsed_url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("URL must have a valid host: {}", url))?;

        if !self.config.allowed_hosts.is_empty()
            && !self
                .config
                .allowed_hosts
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
        {
            return Err(anyhow::anyhow!(
                "Host '{}' is not in the allowed list: {:?}",
                host,
                self.config.allowed_hosts
            ));
        }

        if host == "localhost" || host == "127.0.0.1" {
            warn!("Allowing localhost collaborator URL: {} (should be disabled in production)", url);
        }

        Ok(parsed_url)
    }

    pub async fn post_json<B, R>(&self, url: &Url, body: &B, bearer: Option<&str>) -> Result<R, ExternalError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(url.as_str()).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_send_error)?;
        self.read_json(response).await
    }

    pub async fn post_multipart<R>(
        &self,
        url: &Url,
        form: reqwest::multipart::Form,
        bearer: Option<&str>,
    ) -> Result<R, ExternalError>
    where
        R: DeserializeOwned,
    {
        let mut request = self.client.post(url.as_str()).multipart(form);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_send_error)?;
        self.read_json(response).await
    }

    /// GET `url` and report whether it answered 200
    pub async fn probe(&self, url: &Url) -> bool {
        match self.client.get(url.as_str()).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe failed");
                false
            }
        }
    }

    async fn read_json<R: DeserializeOwned>(&self, response: Response) -> Result<R, ExternalError> {
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ExternalError::Unavailable(format!(
                "HTTP {}",
                status.as_u16()
            )));
        }

        let content_length = response.content_length().unwrap_or(0);
        if content_length > self.config.max_response_size as u64 {
            return Err(ExternalError::Unavailable(format!(
                "response too large: {} bytes (max: {})",
                content_length, self.config.max_response_size
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExternalError::Unavailable(format!("failed to read response body: {}", e)))?;

        if bytes.len() > self.config.max_response_size {
            return Err(ExternalError::Unavailable(format!(
                "response body too large: {} bytes (max: {})",
                bytes.len(),
                self.config.max_response_size
            )));
        }

        if status.is_client_error() {
            let detail = String::from_utf8_lossy(&bytes);
            return Err(ExternalError::Rejected(format!(
                "HTTP {}: {}",
                status.as_u16(),
                detail.chars().take(200).collect::<String>()
            )));
        }

        debug!(status = status.as_u16(), bytes = bytes.len(), "Collaborator response");
        serde_json::from_slice(&bytes)
            .map_err(|e| ExternalError::Unavailable(format!("malformed response: {}", e)))
    }

    pub fn config(&self) -> &HttpSecurityConfig {
        &self.config
    }
}

fn map_send_error(e: reqwest::Error) -> ExternalError {
    if e.is_timeout() {
        ExternalError::Timeout(Duration::ZERO)
    } else {
        ExternalError::Unavailable(format!("request failed: {}", e))
    }
}

/// Join `path` onto a collaborator base URL, keeping any base path prefix
pub fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut joined = base.clone();
    {
        let mut segments = joined
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("URL cannot be a base: {}", base))?;
        segments.pop_if_empty();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            segments.push(segment);
        }
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        let config = HttpSecurityConfig {
            allowed_hosts: vec!["civic.example.org".to_string()],
            ..Default::default()
        };
        let client = SecureHttpClient::new(config).unwrap();

        assert!(client.validate_url("https://ai.civic.example.org/").is_ok());
        assert!(client.validate_url("http://ai.civic.example.org/").is_err());
        assert!(client.validate_url("https://evil.example.com/").is_err());
    }

    #[test]
    fn test_endpoint_join() {
        let base = Url::parse("https://ai.example.org/v1/").unwrap();
        assert_eq!(
            endpoint(&base, "verify").unwrap().as_str(),
            "https://ai.example.org/v1/verify"
        );

        let base = Url::parse("https://signer.example.org").unwrap();
        assert_eq!(
            endpoint(&base, "/settlements").unwrap().as_str(),
            "https://signer.example.org/settlements"
        );
    }
}
