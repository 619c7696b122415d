//! Shared HTTP plumbing for REST/RSS adapters.
//!
//! Each adapter owns its own client (and therefore its own connection pool);
//! pools are never shared across adapters. Transport failures are mapped to
//! the uniform stage envelope here, in one place.

use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;

use super::{RawFetch, Stage, StageError};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 marketbrain/0.1";

/// Connection pool shape per adapter: up to 50 concurrent connections,
/// 10 idle per host, 30s keepalive.
pub fn build_client(timeout: Duration, user_agent: Option<&str>) -> Result<Client, StageError> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .user_agent(user_agent.unwrap_or(DEFAULT_USER_AGENT))
        .build()
        .map_err(|e| {
            StageError::new(
                "http",
                Stage::Fetch,
                "client_build",
                e.to_string(),
                false,
            )
        })
}

/// Send a prepared request and produce the raw payload, classifying every
/// failure mode into the envelope:
/// - timeouts, connect failures          -> retryable
/// - 5xx                                 -> retryable `upstream_error`
/// - 429                                 -> retryable `rate_limited` (+Retry-After)
/// - other 4xx                           -> non-retryable (`auth_failed` on 401/403)
pub async fn send(source: &str, request: RequestBuilder) -> Result<RawFetch, StageError> {
    let response = request.send().await.map_err(|e| map_transport(source, &e))?;

    let status = response.status();
    if status.is_success() {
        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport(source, &e))?;
        return Ok(RawFetch::new(body.to_vec(), status.as_u16()));
    }

    let retry_after = parse_retry_after(&response);
    let body_excerpt = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect::<String>();

    Err(classify_status(source, status, &body_excerpt).with_retry_after(retry_after))
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn map_transport(source: &str, err: &reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::new(
            source,
            Stage::Fetch,
            "timeout",
            err.to_string(),
            true,
        )
    } else if err.is_connect() {
        StageError::new(
            source,
            Stage::Fetch,
            "connection_failed",
            err.to_string(),
            true,
        )
    } else {
        // Request build errors, redirect loops, body read resets.
        StageError::new(source, Stage::Fetch, "transport", err.to_string(), true)
    }
}

fn classify_status(source: &str, status: StatusCode, body: &str) -> StageError {
    let code = status.as_u16();
    let message = format!("HTTP {code}: {body}");
    match code {
        429 => StageError::new(source, Stage::Fetch, "rate_limited", message, true),
        401 | 403 => StageError::new(source, Stage::Fetch, "auth_failed", message, false),
        404 => StageError::new(source, Stage::Fetch, "not_found", message, false),
        500..=599 => StageError::new(source, Stage::Fetch, "upstream_error", message, true),
        _ => StageError::new(source, Stage::Fetch, "client_error", message, false),
    }
}
