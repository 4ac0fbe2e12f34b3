//! HTTP retry helpers for transient errors.
//!
//! Export requests go through [`send_with_retry`] instead of calling
//! `reqwest::RequestBuilder::send()` directly, so every request gets
//! automatic retry with exponential backoff for timeouts, connection
//! resets, server errors and rate limiting.
//!
//! # Usage
//!
//! ```ignore
//! use crate::retry;
//!
//! let response = retry::send_with_retry(|| client.get(&url).query(&params), retry::MAX_RETRIES).await?;
//! ```

use std::time::Duration;

use crate::SourceError;

/// Maximum number of retry attempts for transient HTTP errors.
///
/// With exponential backoff (2s, 4s, 8s, 16s, 32s) the total wait before
/// giving up is 62 seconds.
pub const MAX_RETRIES: u32 = 5;

/// Maximum length of the response body preview included in errors.
const BODY_PREVIEW_LEN: usize = 500;

/// Sends an HTTP request, retrying transient failures, and returns the
/// successful response with its body still unread.
///
/// The `build_request` closure is called on each attempt to construct a
/// fresh [`reqwest::RequestBuilder`] (since builders are consumed by
/// `.send()`).
///
/// Retries connection errors, timeouts, HTTP 429 and HTTP 5xx. HTTP 401
/// and 403 map to [`SourceError::Auth`]; any other 4xx is permanent.
///
/// # Errors
///
/// Returns [`SourceError`] if the request fails after all retries or the
/// server returns a non-retryable status code.
#[allow(clippy::future_not_send)]
pub async fn send_with_retry<F>(
    build_request: F,
    max_retries: u32,
) -> Result<reqwest::Response, SourceError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            log::warn!("  retry {attempt}/{max_retries} in {delay:?}...");
            tokio::time::sleep(delay).await;
        }

        let response = match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && attempt < max_retries {
                    log::warn!("  transient error: {e}");
                    continue;
                }
                return Err(SourceError::Http(e));
            }
            Ok(response) => response,
        };

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if attempt < max_retries {
                log::warn!("  HTTP 429 (rate limited)");
                continue;
            }
            return Err(SourceError::RateLimited {
                retries: max_retries,
            });
        }

        if status.is_server_error() {
            if attempt < max_retries {
                log::warn!("  HTTP {status} (server error)");
                continue;
            }
            return Err(SourceError::Status {
                status: status.as_u16(),
                message: format!("server error after {max_retries} retries"),
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Auth {
                message: format!("HTTP {status}: {}", preview(&body)),
            });
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                message: preview(&body),
            });
        }

        return Ok(response);
    }

    Err(SourceError::Status {
        status: 0,
        message: "request failed after all retries".to_string(),
    })
}

/// Delay before retry number `attempt` (1-based): 2s, 4s, 8s, ...
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

fn preview(body: &str) -> String {
    if body.len() > BODY_PREVIEW_LEN {
        let mut end = BODY_PREVIEW_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}
