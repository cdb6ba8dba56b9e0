//! Map HTTP outcomes onto [`FetchError`] kinds

use crate::error::FetchError;
use std::time::Duration;

/// Longest error-body excerpt kept in messages
const MAX_ERROR_EXCERPT: usize = 200;

/// Summarize an Overpass error body into one short line
pub fn summarize_error_body(body: &str) -> String {
    let lower = body.to_lowercase();
    if lower.contains("rate_limited") {
        "rate limited by Overpass API".to_string()
    } else if lower.contains("timeout") {
        "query timeout on Overpass API".to_string()
    } else if lower.contains("too many requests") {
        "too many requests to Overpass API".to_string()
    } else if lower.contains("runtime error") {
        "runtime error on Overpass API".to_string()
    } else {
        let first_line = body.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        let excerpt: String = first_line.chars().take(MAX_ERROR_EXCERPT).collect();
        format!("Overpass API error: {excerpt}")
    }
}

/// Classify a non-success HTTP status
///
/// 429 is a rate limit, 5xx is transient, every other status is permanent.
pub fn classify_status(endpoint: &str, status: u16, body: &str) -> FetchError {
    let message = summarize_error_body(body);
    match status {
        429 => FetchError::RateLimited {
            endpoint: endpoint.to_string(),
            message,
        },
        500..=599 => FetchError::TransientService {
            endpoint: endpoint.to_string(),
            status: Some(status),
            message,
        },
        _ => FetchError::Permanent {
            endpoint: endpoint.to_string(),
            status,
            message,
        },
    }
}

/// Classify a transport-level failure (no usable response)
pub fn classify_transport(endpoint: &str, error: &reqwest::Error, timeout: Duration) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            endpoint: endpoint.to_string(),
            after: timeout,
        }
    } else if error.is_connect() {
        FetchError::TransientService {
            endpoint: endpoint.to_string(),
            status: None,
            message: format!("connection failed: {error}"),
        }
    } else if let Some(status) = error.status() {
        classify_status(endpoint, status.as_u16(), &error.to_string())
    } else {
        FetchError::TransientService {
            endpoint: endpoint.to_string(),
            status: None,
            message: format!("network error: {error}"),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Classify;

    #[test]
    fn summarizes_known_error_bodies() {
        assert_eq!(
            summarize_error_body("<p>Error: rate_limited</p>"),
            "rate limited by Overpass API"
        );
        assert_eq!(
            summarize_error_body("runtime error: Query timed out: Timeout"),
            "query timeout on Overpass API"
        );
        assert_eq!(
            summarize_error_body("Runtime error: open64: 0 Success"),
            "runtime error on Overpass API"
        );
    }

    #[test]
    fn truncates_unknown_bodies_to_first_line() {
        let body = format!("\n{}\nsecond line", "x".repeat(500));
        let summary = summarize_error_body(&body);
        assert!(summary.starts_with("Overpass API error: xxx"));
        assert_eq!(summary.len(), "Overpass API error: ".len() + 200);
        assert!(!summary.contains("second"));
    }

    #[test]
    fn statuses_map_to_kinds() {
        assert_eq!(classify_status("e", 429, "").classification(), "rate-limited");
        assert_eq!(
            classify_status("e", 503, "").classification(),
            "transient-service-error"
        );
        assert_eq!(
            classify_status("e", 504, "").classification(),
            "transient-service-error"
        );
        assert_eq!(classify_status("e", 400, "bad").classification(), "permanent-error");
        assert_eq!(classify_status("e", 404, "").classification(), "permanent-error");
    }
}
