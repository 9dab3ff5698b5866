//! Image classifier client
//!
//! The classifier is an opaque scorer: given an image and the reported
//! category it answers whether the image shows that kind of issue.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::http::{SecureHttpClient, endpoint};
use super::ExternalError;
use crate::config::mask_secret;
use crate::issues::models::{AiResult, Category};

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &ImageUpload, category: Category) -> Result<AiResult, ExternalError>;

    /// Whether the classifier currently answers
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Response body of `POST /verify`
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    ai_verified: bool,
    confidence: f64,
    prediction: String,
}

pub struct HttpClassifier {
    http: SecureHttpClient,
    verify_url: Url,
    health_url: Url,
    api_token: Option<String>,
}

impl HttpClassifier {
    pub fn new(http: SecureHttpClient, base_url: &str, api_token: Option<String>) -> anyhow::Result<Self> {
        let base = http.validate_url(base_url)?;
        let verify_url = endpoint(&base, "verify")?;
        let health_url = endpoint(&base, "health")?;
        info!(
            url = %verify_url,
            token = %api_token.as_deref().map(mask_secret).unwrap_or_else(|| "<none>".to_string()),
            "Configured image classifier"
        );
        Ok(Self {
            http,
            verify_url,
            health_url,
            api_token,
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: &ImageUpload, category: Category) -> Result<AiResult, ExternalError> {
        let part = Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)
            .map_err(|e| ExternalError::Rejected(format!("invalid content type: {}", e)))?;
        let form = Form::new()
            .part("image_file", part)
            .text("category", category.as_str().to_lowercase());

        let response: VerifyResponse = self
            .http
            .post_multipart(&self.verify_url, form, self.api_token.as_deref())
            .await?;
        debug!(
            verified = response.ai_verified,
            confidence = response.confidence,
            prediction = %response.prediction,
            "Classifier response"
        );

        let result = AiResult {
            verified: response.ai_verified,
            confidence: response.confidence,
            predicted_label: response.prediction,
        };
        result
            .validate()
            .map_err(|e| ExternalError::Unavailable(format!("classifier returned {}", e)))?;
        Ok(result)
    }

    async fn is_healthy(&self) -> bool {
        self.http.probe(&self.health_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::http::HttpSecurityConfig;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use serde_json::{Value, json};

    async fn verify(headers: HeaderMap) -> (StatusCode, axum::Json<Value>) {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer classifier-secret") => (
                StatusCode::OK,
                axum::Json(json!({"ai_verified": true, "confidence": 0.91, "prediction": "pothole"})),
            ),
            _ => (StatusCode::UNAUTHORIZED, axum::Json(json!({"error": "unauthorized"}))),
        }
    }

    async fn serve_classifier() -> String {
        let app = Router::new()
            .route("/verify", post(verify))
            .route("/health", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn local_client() -> SecureHttpClient {
        SecureHttpClient::new(HttpSecurityConfig {
            require_https: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn image() -> ImageUpload {
        ImageUpload {
            file_name: "hole.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: vec![0xff, 0xd8, 0xff],
        }
    }

    #[tokio::test]
    async fn test_classify_sends_token() {
        let base = serve_classifier().await;

        let classifier = HttpClassifier::new(local_client(), &base, Some("classifier-secret".to_string())).unwrap();
        let result = classifier.classify(&image(), Category::Pothole).await.unwrap();
        assert!(result.verified);
        assert_eq!(result.predicted_label, "pothole");

        let anonymous = HttpClassifier::new(local_client(), &base, None).unwrap();
        let err = anonymous.classify(&image(), Category::Pothole).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_health_probe() {
        let base = serve_classifier().await;
        let classifier = HttpClassifier::new(local_client(), &base, None).unwrap();
        assert!(classifier.is_healthy().await);

        let missing = HttpClassifier::new(local_client(), "http://127.0.0.1:9/", None).unwrap();
        assert!(!missing.is_healthy().await);
    }
}
