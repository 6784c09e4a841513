use crate::ProviderError;
use chrono::{DateTime, NaiveDateTime, Utc};
use genapply_core::{CancellationToken, LlmConfig, ProviderId};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use std::error::Error as StdError;
use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

/// Base delay for transport error retries.
const NETWORK_RETRY_BASE_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub(crate) struct HttpSettings {
    pub provider: ProviderId,
    pub client: Client,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    /// Upper bound on any single retry wait, including a server `Retry-After`.
    pub max_retry_wait: Duration,
}

impl HttpSettings {
    pub fn new(provider: ProviderId, cfg: &LlmConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        Ok(Self {
            provider,
            client,
            max_retries: cfg.max_retries,
            retry_base_ms: cfg.retry_base_ms,
            max_retry_wait: Duration::from_secs(cfg.timeout_seconds),
        })
    }

    /// Sends the request built by `build`, retrying rate limits, server
    /// errors and transport failures. Only a successful response is returned,
    /// so nothing has been streamed to the caller when a retry happens.
    pub fn send(&self, build: impl Fn(&Client) -> RequestBuilder) -> Result<Response, ProviderError> {
        let mut last_err: Option<ProviderError> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.max_retries {
            match build(&self.client).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text().unwrap_or_default();
                    last_err = Some(format_api_error(self.provider, status, &body));
                    if should_retry_status(status) && attempt < self.max_retries {
                        thread::sleep(
                            retry_delay_ms(self.retry_base_ms, attempt, retry_after)
                                .min(self.max_retry_wait),
                        );
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(self.provider, &e));
                    if should_retry_transport_error(&e) && attempt < self.max_retries {
                        thread::sleep(
                            retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None)
                                .min(self.max_retry_wait),
                        );
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ProviderError::Transport(format!("{} request failed without detailed error", self.provider))
        }))
    }
}

/// Walks the `data:` frames of a server-sent event body until `[DONE]` or
/// end of stream. Frames that are not JSON are skipped.
pub(crate) fn for_each_sse_value(
    resp: Response,
    cancel: &CancellationToken,
    mut on_value: impl FnMut(Value),
) -> Result<(), ProviderError> {
    let reader = BufReader::new(resp);
    for line_result in reader.lines() {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let line = line_result.map_err(|e| ProviderError::Stream(e.to_string()))?;
        let trimmed = line.trim();
        let Some(chunk) = trimmed.strip_prefix("data:") else {
            continue;
        };
        let chunk = chunk.trim();
        if chunk == "[DONE]" {
            break;
        }
        if let Ok(value) = serde_json::from_str::<Value>(chunk) {
            on_value(value);
        }
    }
    Ok(())
}

fn format_api_error(provider: ProviderId, status: StatusCode, body: &str) -> ProviderError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());
    let detail = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            format!("invalid or missing API key ({detail})")
        }
        StatusCode::TOO_MANY_REQUESTS => format!("rate limited, retries exhausted ({detail})"),
        _ => detail,
    };
    ProviderError::Api {
        provider,
        status: status.as_u16(),
        detail,
    }
}

fn format_transport_error(provider: ProviderId, err: &reqwest::Error) -> ProviderError {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host");

    let message = if err.is_timeout() {
        format!("{provider} request timed out; consider raising llm.timeout_seconds")
    } else if is_dns {
        format!("DNS resolution failed for the {provider} endpoint")
    } else if err.is_connect() {
        format!("could not connect to the {provider} endpoint")
    } else {
        format!("network error talking to {provider}: {err}")
    };
    ProviderError::Transport(message)
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
    Duration::from_millis(exponential.max(base_ms))
}
