use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::time::sleep;

use crate::{
    request::resolve_url, ClientError, ClientOptions, Request, Result, RetryPolicy,
};

/// JSON HTTP client for the POS backend with bounded retry.
///
/// Transport failures are retried with exponential backoff; responses with a
/// 4xx/5xx status are returned as [`ClientError::Http`] without retrying
/// unless the status is listed in [`RetryPolicy::retry_statuses`].
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    options: ClientOptions,
}

impl ApiClient {
    /// Creates a client resolving relative request paths against `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim().to_owned(),
            options: ClientOptions::default(),
        }
    }

    /// Creates a client from the `POS_API_BASE_URL` environment variable.
    ///
    /// Returns an error if the variable is missing or empty.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pos_link::ApiClient;
    ///
    /// let api = ApiClient::from_env().expect("missing POS_API_BASE_URL");
    /// ```
    pub fn from_env() -> std::result::Result<Self, String> {
        let url = std::env::var("POS_API_BASE_URL")
            .map_err(|_| "missing POS_API_BASE_URL environment variable".to_owned())?;
        if url.trim().is_empty() {
            return Err("POS_API_BASE_URL is set but empty".to_owned());
        }
        Ok(Self::new(url))
    }

    /// Applies client options such as timeout and the default retry policy.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    /// Uses a preconfigured `reqwest` client (proxies, TLS roots, ...).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Performs `req` with the client's default retry policy.
    pub async fn fetch(&self, req: &Request) -> Result<JsonValue> {
        self.request(req, &self.options.retry).await
    }

    /// Performs `req` and deserializes the JSON response into `T`.
    pub async fn fetch_json<T: DeserializeOwned>(&self, req: &Request) -> Result<T> {
        self.request_json(req, &self.options.retry).await
    }

    /// Performs `req` under `policy` and deserializes the response into `T`.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        req: &Request,
        policy: &RetryPolicy,
    ) -> Result<T> {
        let value = self.request(req, policy).await?;
        serde_json::from_value(value)
            .map_err(|err| ClientError::Decode(format!("unexpected response shape: {err}")))
    }

    /// Performs `req` up to `policy.max_attempts` times and returns the JSON body.
    pub async fn request(&self, req: &Request, policy: &RetryPolicy) -> Result<JsonValue> {
        let url = resolve_url(&self.base_url, &req.path);
        let attempts = policy.attempts();
        let mut attempt = 0usize;
        loop {
            let err = match self.send_once(&url, req).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            #[cfg(feature = "tracing")]
            tracing::warn!(
                method = %req.method,
                url = %url,
                attempt = attempt + 1,
                attempts,
                error = %err,
                "request attempt failed"
            );

            let retryable = match &err {
                ClientError::Http { status, .. } => policy.retries_status(*status),
                other => other.is_retryable(),
            };
            if retryable && attempt + 1 < attempts {
                wait_before_retry(policy, attempt).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }

    async fn send_once(&self, url: &str, req: &Request) -> Result<JsonValue> {
        let mut builder = self
            .http
            .request(req.method.clone(), url)
            .timeout(self.options.timeout);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_builder() {
                ClientError::InvalidRequest(err.to_string())
            } else {
                ClientError::Transport(err)
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(ClientError::Transport)?;

        if status.is_client_error() || status.is_server_error() {
            return Err(http_error(status, &body));
        }
        decode_success_body(&body)
    }
}

/// Sleeps the backoff delay that follows failed attempt `attempt`.
async fn wait_before_retry(policy: &RetryPolicy, attempt: usize) {
    let delay = policy.delay_for(attempt);

    #[cfg(feature = "tracing")]
    tracing::debug!("retrying request after {} ms", delay.as_millis());

    sleep(delay).await;
}

fn decode_success_body(body: &str) -> Result<JsonValue> {
    if body.trim().is_empty() {
        return Ok(JsonValue::Null);
    }
    serde_json::from_str(body)
        .map_err(|err| ClientError::Decode(format!("invalid response JSON: {err}; body: {body}")))
}

/// Builds the terminal error for a 4xx/5xx response.
///
/// A FastAPI-style `{"detail": "..."}` body supplies the message; anything
/// else falls back to `HTTP <status>`.
fn http_error(status: StatusCode, body: &str) -> ClientError {
    let detail = serde_json::from_str::<JsonValue>(body).ok();
    let message = detail
        .as_ref()
        .and_then(|value| value.get("detail"))
        .and_then(JsonValue::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    #[cfg(feature = "tracing")]
    tracing::debug!(status = status.as_u16(), %message, "server rejected request");

    ClientError::Http {
        status: status.as_u16(),
        message,
        detail,
    }
}
