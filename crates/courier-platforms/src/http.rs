//! Generic HTTP adapter for the supported platforms.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_store::{Credentials, Platform};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::adapter::{PlatformAdapter, PublishContext, PublishReceipt, Rendered};
use crate::error::{PublishError, RefreshError};

/// Token lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Endpoints and OAuth client settings for one platform.
#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub platform: Platform,
    pub api_base: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub request_timeout: Duration,
}

impl HttpAdapterConfig {
    /// Public API endpoints for `platform`.
    pub fn defaults_for(platform: Platform) -> Self {
        let (api_base, token_url) = match platform {
            Platform::Twitter => ("https://api.x.com", "https://api.x.com/2/oauth2/token"),
            Platform::Instagram => (
                "https://graph.instagram.com/v21.0",
                "https://graph.instagram.com/refresh_access_token",
            ),
            Platform::Linkedin => (
                "https://api.linkedin.com",
                "https://www.linkedin.com/oauth/v2/accessToken",
            ),
            Platform::Facebook => (
                "https://graph.facebook.com/v21.0",
                "https://graph.facebook.com/v21.0/oauth/access_token",
            ),
        };
        Self {
            platform,
            api_base: api_base.to_string(),
            token_url: token_url.to_string(),
            client_id: String::new(),
            client_secret: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Defaults overridden by `COURIER_<PLATFORM>_{API_BASE,TOKEN_URL,CLIENT_ID,CLIENT_SECRET}`.
    pub fn from_env(platform: Platform) -> Self {
        let prefix = format!("COURIER_{}", platform.as_str().to_ascii_uppercase());
        let var = |name: &str| {
            std::env::var(format!("{}_{}", prefix, name))
                .ok()
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::defaults_for(platform);
        if let Some(base) = var("API_BASE") {
            config.api_base = base;
        }
        if let Some(url) = var("TOKEN_URL") {
            config.token_url = url;
        }
        if let Some(id) = var("CLIENT_ID") {
            config.client_id = id;
        }
        config.client_secret = var("CLIENT_SECRET");
        config
    }
}

/// Error body shapes used by the supported platforms.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(alias = "title", alias = "error")]
    error: Option<Value>,
    #[serde(alias = "detail", alias = "error_description")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Adapter that publishes through a platform's REST API.
pub struct HttpPlatformAdapter {
    http: Client,
    config: HttpAdapterConfig,
}

impl HttpPlatformAdapter {
    pub fn new(config: HttpAdapterConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &HttpAdapterConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        credentials: &Credentials,
        ctx: &PublishContext,
    ) -> Result<(Value, Option<String>), PublishError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&credentials.access_token)
            .header("Idempotency-Key", &ctx.idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let response = check_status(response).await?;
        let restli_id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // The post may exist even if the body is unreadable; never retry it.
        let body = response
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);
        Ok((body, restli_id))
    }

    async fn publish_inner(
        &self,
        rendered: &Rendered,
        credentials: &Credentials,
        ctx: &PublishContext,
    ) -> Result<PublishReceipt, PublishError> {
        let media: Vec<&str> = rendered.media_refs.iter().map(|m| m.as_str()).collect();

        let id = match self.config.platform {
            Platform::Twitter => {
                let mut body = json!({ "text": rendered.content });
                if !media.is_empty() {
                    body["media"] = json!({ "media_ids": media });
                }
                let (resp, _) = self.post_json("/2/tweets", &body, credentials, ctx).await?;
                resp.pointer("/data/id").and_then(id_string)
            }
            Platform::Linkedin => {
                let body = json!({
                    "commentary": rendered.content,
                    "visibility": "PUBLIC",
                    "lifecycleState": "PUBLISHED",
                    "distribution": { "feedDistribution": "MAIN_FEED" },
                    "content": if media.is_empty() { Value::Null } else { json!({ "multiImage": { "images": media } }) },
                });
                let (resp, header_id) =
                    self.post_json("/rest/posts", &body, credentials, ctx).await?;
                header_id.or_else(|| resp.get("id").and_then(id_string))
            }
            Platform::Facebook => {
                let body = json!({
                    "message": rendered.content,
                    "attached_media": media,
                });
                let (resp, _) = self.post_json("/me/feed", &body, credentials, ctx).await?;
                resp.get("id").and_then(id_string)
            }
            Platform::Instagram => {
                let body = json!({
                    "caption": rendered.content,
                    "image_url": media.first(),
                    "children": if media.len() > 1 { json!(media) } else { Value::Null },
                });
                let (container, _) = self.post_json("/me/media", &body, credentials, ctx).await?;
                let creation_id = container.get("id").and_then(id_string).ok_or_else(|| {
                    PublishError::permanent("invalid_response: media container without id")
                })?;
                let (resp, _) = self
                    .post_json(
                        "/me/media_publish",
                        &json!({ "creation_id": creation_id }),
                        credentials,
                        ctx,
                    )
                    .await?;
                resp.get("id").and_then(id_string)
            }
        };

        let platform_post_id =
            id.ok_or_else(|| PublishError::permanent("invalid_response: missing post id"))?;
        let url = permalink(self.config.platform, &platform_post_id);
        Ok(PublishReceipt {
            platform_post_id,
            url,
        })
    }
}

#[async_trait]
impl PlatformAdapter for HttpPlatformAdapter {
    fn platform(&self) -> Platform {
        self.config.platform
    }

    async fn publish(
        &self,
        rendered: &Rendered,
        credentials: &Credentials,
        ctx: &PublishContext,
    ) -> Result<PublishReceipt, PublishError> {
        debug!(
            platform = %self.config.platform,
            attempt_id = %ctx.attempt_id,
            chars = rendered.content.chars().count(),
            "publishing"
        );
        tokio::select! {
            biased;
            _ = ctx.aborted() => {
                warn!(platform = %self.config.platform, attempt_id = %ctx.attempt_id, "publish aborted");
                Err(PublishError::transient("aborted"))
            }
            result = self.publish_inner(rendered, credentials, ctx) => result,
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];

        let mut request = self.http.post(&self.config.token_url).form(&params);
        if let Some(secret) = &self.config.client_secret {
            request = request.basic_auth(&self.config.client_id, Some(secret));
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let ttl = token.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        Ok(Credentials {
            access_token: token.access_token,
            // Platforms that do not rotate refresh tokens omit them.
            refresh_token: token
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl),
        })
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn permalink(platform: Platform, id: &str) -> Option<String> {
    match platform {
        Platform::Twitter => Some(format!("https://x.com/i/web/status/{}", id)),
        Platform::Linkedin => Some(format!("https://www.linkedin.com/feed/update/{}", id)),
        Platform::Facebook => Some(format!("https://www.facebook.com/{}", id)),
        // Instagram permalinks need a shortcode lookup.
        Platform::Instagram => None,
    }
}

fn classify_transport(err: reqwest::Error) -> PublishError {
    if err.is_builder() {
        PublishError::permanent(format!("request: {}", err))
    } else {
        PublishError::transient(format!("network: {}", err))
    }
}

/// Map a non-success response to the retry taxonomy.
async fn check_status(response: Response) -> Result<Response, PublishError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(PublishError::Transient {
            reason: "rate_limit".to_string(),
            retry_after,
        });
    }

    let text = response.text().await.unwrap_or_default();
    let detail = match serde_json::from_str::<ApiError>(&text) {
        Ok(ApiError {
            message: Some(message),
            ..
        }) => message,
        Ok(ApiError {
            error: Some(error), ..
        }) => error.to_string(),
        _ => text.chars().take(200).collect(),
    };

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Err(PublishError::transient(format!(
            "upstream ({}): {}",
            status.as_u16(),
            detail
        )))
    } else {
        Err(PublishError::permanent(format!(
            "rejected ({}): {}",
            status.as_u16(),
            detail
        )))
    }
}
