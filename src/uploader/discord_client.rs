use reqwest::{multipart, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::cmp::min;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration, Instant};

use crate::errors::{AppError, AppResult};

use super::progress_tracker::is_session_cancelled;
use super::{cancellable_sleep, CancelFlag};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts for 5xx, timeouts and connection errors
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub max_rate_limit_retries: u32,
    pub max_rate_limit_wait_ms: u64,
    /// Minimum spacing between requests to the same webhook
    pub min_request_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            max_rate_limit_retries: 5,
            max_rate_limit_wait_ms: 60_000,
            min_request_interval_ms: 1000,
            request_timeout_secs: 120,
        }
    }
}

impl RetryConfig {
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64
            * self
                .exponential_base
                .powi(attempt.saturating_sub(1) as i32);
        min(
            Duration::from_millis(delay_ms as u64),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// How a non-success response is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    RateLimited,
    Transient,
    Rejected,
}

pub fn classify_status(status: StatusCode) -> ResponseClass {
    if status.is_success() {
        ResponseClass::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ResponseClass::RateLimited
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ResponseClass::Transient
    } else {
        ResponseClass::Rejected
    }
}

/// Webhook client with per-webhook request spacing and retry handling
pub struct DiscordClient {
    client: Client,
    rate_limiter: Arc<Mutex<HashMap<String, Instant>>>,
    retry_config: RetryConfig,
}

impl DiscordClient {
    pub fn new(retry_config: RetryConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(retry_config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
            retry_config,
        })
    }

    /// Post one payload and return the response body.
    ///
    /// 429 responses are waited out and retried up to the rate-limit budget.
    /// 5xx, timeouts and connection errors back off exponentially. Every other
    /// status comes back as `EndpointRejected` for the caller to interpret.
    pub async fn send_webhook_with_thread_id(
        &self,
        webhook_url: &str,
        payload: &UploadPayload,
        thread_id: Option<&str>,
        cancel: &CancelFlag,
    ) -> AppResult<String> {
        let webhook_key = webhook_key(webhook_url);
        let final_url = build_webhook_url(webhook_url, thread_id);
        let mut transient_attempts = 0;
        let mut rate_limit_retries = 0;

        loop {
            if is_session_cancelled(cancel) {
                return Err(AppError::cancelled("request"));
            }

            self.wait_for_rate_limit(&webhook_key).await;
            let form = payload.build_form()?;

            log::debug!(
                "POST {} files to webhook {} (thread: {:?})",
                payload.file_count(),
                webhook_key,
                thread_id
            );
            let result = self.client.post(&final_url).multipart(form).send().await;
            self.mark_request(&webhook_key);

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    transient_attempts += 1;
                    if transient_attempts >= self.retry_config.max_attempts {
                        return Err(AppError::TransientNetwork(e.to_string()));
                    }
                    let delay = self.retry_config.backoff_delay(transient_attempts);
                    log::warn!(
                        "Request to webhook {} failed (attempt {}), retrying in {:?}: {}",
                        webhook_key,
                        transient_attempts,
                        delay,
                        e
                    );
                    cancellable_sleep(delay, cancel, "network backoff").await?;
                    continue;
                }
            };

            let status = response.status();
            if classify_status(status) == ResponseClass::Success {
                return Ok(response.text().await?);
            }

            let header_delay = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();

            match classify_status(status) {
                ResponseClass::RateLimited => {
                    rate_limit_retries += 1;
                    let delay = parse_retry_after_body(&body)
                        .or(header_delay)
                        .unwrap_or_else(|| self.retry_config.backoff_delay(rate_limit_retries));

                    if rate_limit_retries > self.retry_config.max_rate_limit_retries {
                        return Err(AppError::RateLimited {
                            retry_after_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        });
                    }

                    let bounded = min(
                        delay,
                        Duration::from_millis(self.retry_config.max_rate_limit_wait_ms),
                    );
                    log::warn!(
                        "Rate limited by webhook {}, waiting {:?} (retry {}/{})",
                        webhook_key,
                        bounded,
                        rate_limit_retries,
                        self.retry_config.max_rate_limit_retries
                    );
                    cancellable_sleep(bounded, cancel, "rate limit wait").await?;
                }
                ResponseClass::Transient => {
                    transient_attempts += 1;
                    if transient_attempts >= self.retry_config.max_attempts {
                        return Err(AppError::TransientNetwork(format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            summarize(&body)
                        )));
                    }
                    let delay = self.retry_config.backoff_delay(transient_attempts);
                    log::warn!(
                        "Webhook {} returned {}, retrying in {:?}",
                        webhook_key,
                        status,
                        delay
                    );
                    cancellable_sleep(delay, cancel, "server error backoff").await?;
                }
                ResponseClass::Rejected | ResponseClass::Success => {
                    return Err(AppError::rejected(status.as_u16(), &summarize(&body)));
                }
            }
        }
    }

    pub async fn send_text_message(
        &self,
        webhook_url: &str,
        content: &str,
        thread_id: Option<&str>,
        cancel: &CancelFlag,
    ) -> AppResult<String> {
        let mut payload = UploadPayload::new();
        payload.add_text_field("content", content);
        self.send_webhook_with_thread_id(webhook_url, &payload, thread_id, cancel)
            .await
    }

    /// Pre-flight check that the webhook exists and is reachable
    pub async fn verify_destination(&self, webhook_url: &str) -> AppResult<()> {
        let response = self.client.get(webhook_url).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AppError::rejected(status.as_u16(), &summarize(&body)))
    }

    async fn wait_for_rate_limit(&self, webhook_key: &str) {
        let min_interval = Duration::from_millis(self.retry_config.min_request_interval_ms);
        let wait_time = match self.rate_limiter.lock() {
            Ok(rate_limiter) => rate_limiter
                .get(webhook_key)
                .map(|last| last.elapsed())
                .filter(|elapsed| *elapsed < min_interval)
                .map(|elapsed| min_interval - elapsed),
            Err(e) => {
                log::warn!("Failed to acquire rate limiter lock (non-critical): {}", e);
                None
            }
        };

        if let Some(wait_time) = wait_time {
            sleep(wait_time).await;
        }
    }

    fn mark_request(&self, webhook_key: &str) {
        match self.rate_limiter.lock() {
            Ok(mut rate_limiter) => {
                rate_limiter.insert(webhook_key.to_string(), Instant::now());
            }
            Err(e) => {
                log::warn!("Failed to update rate limiter (non-critical): {}", e);
            }
        }
    }
}

/// Webhook id segment of the URL, used to key request spacing
fn webhook_key(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.trim_end_matches('/')
        .split('/')
        .nth_back(1)
        .unwrap_or("default")
        .to_string()
}

pub fn build_webhook_url(webhook_url: &str, thread_id: Option<&str>) -> String {
    let mut params = vec!["wait=true".to_string()];
    if let Some(tid) = thread_id {
        params.push(format!("thread_id={}", tid));
    }

    let separator = if webhook_url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", webhook_url, separator, params.join("&"))
}

fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(seconds_to_duration)
}

fn parse_retry_after_body(body: &str) -> Option<Duration> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("retry_after")?
        .as_f64()
        .and_then(seconds_to_duration)
}

/// Values too large for a `Duration` saturate; the caller bounds the wait.
fn seconds_to_duration(secs: f64) -> Option<Duration> {
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 300 {
        format!("{}...", trimmed.chars().take(300).collect::<String>())
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone)]
struct PayloadFile {
    filename: String,
    data: Arc<Vec<u8>>,
    mime_type: String,
}

/// Multipart body for one webhook message
#[derive(Debug, Clone, Default)]
pub struct UploadPayload {
    files: Vec<PayloadFile>,
    text_fields: Vec<(String, String)>,
}

impl UploadPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_text_field(&mut self, key: &str, value: &str) {
        self.text_fields.retain(|(k, _)| k != key);
        self.text_fields.push((key.to_string(), value.to_string()));
    }

    pub fn add_file(&mut self, filename: &str, data: Arc<Vec<u8>>, mime_type: &str) {
        self.files.push(PayloadFile {
            filename: filename.to_string(),
            data,
            mime_type: mime_type.to_string(),
        });
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    pub fn build_form(&self) -> AppResult<multipart::Form> {
        let mut form = multipart::Form::new();

        for (key, value) in &self.text_fields {
            form = form.text(key.clone(), value.clone());
        }

        for (index, file) in self.files.iter().enumerate() {
            let part = multipart::Part::bytes(file.data.as_ref().clone())
                .file_name(file.filename.clone())
                .mime_str(&file.mime_type)?;
            form = form.part(format!("files[{}]", index), part);
        }

        Ok(form)
    }
}

/// Thread id of a freshly created forum post: `channel_id`, else `id`
pub fn extract_thread_id(response_data: &str) -> Option<String> {
    let json: serde_json::Value = match serde_json::from_str(response_data) {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to parse webhook response as JSON: {}", e);
            return None;
        }
    };

    let thread_id = ["channel_id", "id"]
        .iter()
        .find_map(|field| json.get(*field).and_then(|v| v.as_str()))
        .map(str::to_string);

    if thread_id.is_none() {
        log::error!("No thread id found in webhook response (channel_id, id)");
    }
    thread_id
}
