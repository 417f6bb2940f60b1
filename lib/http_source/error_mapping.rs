use std::error::Error as StdError;
use std::time::Duration;

use reqwest::header::HeaderMap;

use super::{retry_after_header, ApiError};
use crate::pipeline::{FetchError, FetchErrorKind};
use crate::scan::{DiscoveryError, DiscoveryErrorKind};

/// Seconds-valued `Retry-After`. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = retry_after_header(headers)?.trim().parse::<f64>().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// 429 always counts. A 403 counts when its body says so, and any other failure counts when the
/// remaining budget header reads zero.
pub fn is_rate_limit_exceeded(status: u16, remaining: Option<&str>, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    if status == 403 && body.to_ascii_lowercase().contains("rate limit") {
        return true;
    }
    !(200..300).contains(&status) && remaining.is_some_and(|value| value.trim() == "0")
}

pub(super) fn map_api_error_to_fetch(error: ApiError) -> FetchError {
    match error {
        ApiError::RateLimited {
            resource,
            retry_after,
            ..
        } => FetchError::new(
            FetchErrorKind::RateLimited,
            format!("rate limited while fetching {resource}"),
        )
        .with_retry_after(retry_after),
        ApiError::UnexpectedStatus { resource, status } => {
            map_status_to_fetch_error(&resource, status)
        }
        ApiError::Malformed { resource, message } => FetchError::new(
            FetchErrorKind::Other,
            format!("malformed response for {resource}: {message}"),
        ),
        ApiError::Request(req_err) => {
            if let Some(status) = req_err.status() {
                return map_status_to_fetch_error("item", status.as_u16());
            }
            if is_transport_error(&req_err) {
                return FetchError::new(
                    FetchErrorKind::Network,
                    format!("network/transport error while fetching item: {}", render_error_chain(&req_err)),
                );
            }
            FetchError::new(FetchErrorKind::Other, format!("{req_err:#}"))
        }
    }
}

pub(super) fn map_api_error_to_discovery(error: ApiError) -> DiscoveryError {
    match error {
        ApiError::RateLimited { retry_after, .. } => DiscoveryError::rate_limited(retry_after),
        ApiError::UnexpectedStatus { resource, status } => {
            let kind = match status {
                500..=599 => DiscoveryErrorKind::Transient,
                _ => DiscoveryErrorKind::Fatal,
            };
            DiscoveryError::new(
                kind,
                format!("unexpected HTTP status {status} while fetching {resource}"),
            )
        }
        ApiError::Malformed { resource, message } => DiscoveryError::new(
            DiscoveryErrorKind::Fatal,
            format!("malformed response for {resource}: {message}"),
        ),
        ApiError::Request(req_err) => {
            let kind = match req_err.status() {
                Some(status) if status.is_server_error() => DiscoveryErrorKind::Transient,
                Some(_) => DiscoveryErrorKind::Fatal,
                None if is_transport_error(&req_err) => DiscoveryErrorKind::Transient,
                None => DiscoveryErrorKind::Fatal,
            };
            DiscoveryError::new(kind, render_error_chain(&req_err))
        }
    }
}

fn map_status_to_fetch_error(resource: &str, status: u16) -> FetchError {
    match status {
        401 | 403 => FetchError::new(
            FetchErrorKind::Unauthorized,
            format!("not authorized ({status}) while fetching {resource}"),
        ),
        404 | 410 => FetchError::new(
            FetchErrorKind::NotFound,
            format!("not found while fetching {resource}"),
        ),
        429 => FetchError::new(
            FetchErrorKind::RateLimited,
            format!("rate limited while fetching {resource}"),
        ),
        400..=499 => FetchError::new(
            FetchErrorKind::Other,
            format!("upstream client error {status} while fetching {resource}"),
        ),
        500..=599 => FetchError::new(
            FetchErrorKind::UpstreamUnavailable,
            format!("upstream server error {status} while fetching {resource}"),
        ),
        _ => FetchError::new(
            FetchErrorKind::Other,
            format!("unexpected HTTP status {status} while fetching {resource}"),
        ),
    }
}

/// Timeouts, refused connections and truncated bodies; decode failures are retried too since a
/// cut-off JSON body looks the same.
fn is_transport_error(req_err: &reqwest::Error) -> bool {
    req_err.is_timeout()
        || req_err.is_connect()
        || req_err.is_request()
        || req_err.is_body()
        || req_err.is_decode()
}

fn render_error_chain(error: &reqwest::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(next) = source {
        parts.push(next.to_string());
        source = next.source();
    }
    parts.join(" | caused_by: ")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    use super::{
        is_rate_limit_exceeded, map_api_error_to_discovery, map_api_error_to_fetch,
        parse_retry_after,
    };
    use crate::http_source::ApiError;
    use crate::pipeline::FetchErrorKind;
    use crate::scan::DiscoveryErrorKind;

    fn status(status: u16) -> ApiError {
        ApiError::UnexpectedStatus {
            resource: "photo abc".to_string(),
            status,
        }
    }

    #[test]
    fn fetch_statuses_map_to_kinds() {
        let cases = [
            (401, FetchErrorKind::Unauthorized),
            (403, FetchErrorKind::Unauthorized),
            (404, FetchErrorKind::NotFound),
            (429, FetchErrorKind::RateLimited),
            (418, FetchErrorKind::Other),
            (503, FetchErrorKind::UpstreamUnavailable),
        ];
        for (code, kind) in cases {
            assert_eq!(map_api_error_to_fetch(status(code)).kind, kind, "status {code}");
        }
        assert!(!map_api_error_to_fetch(status(404)).is_retryable());
        assert!(map_api_error_to_fetch(status(502)).is_retryable());
    }

    #[test]
    fn rate_limits_keep_retry_after() {
        let error = ApiError::RateLimited {
            resource: "listing page 3".to_string(),
            status: 429,
            retry_after: Some(Duration::from_secs(7)),
        };
        let fetch = map_api_error_to_fetch(error);
        assert_eq!(fetch.kind, FetchErrorKind::RateLimited);
        assert_eq!(fetch.retry_after, Some(Duration::from_secs(7)));

        let discovery = map_api_error_to_discovery(ApiError::RateLimited {
            resource: "listing page 3".to_string(),
            status: 403,
            retry_after: None,
        });
        assert_eq!(discovery.kind, DiscoveryErrorKind::RateLimited);
        assert!(!discovery.is_retryable());
    }

    #[test]
    fn discovery_only_retries_server_errors() {
        assert_eq!(
            map_api_error_to_discovery(status(500)).kind,
            DiscoveryErrorKind::Transient
        );
        assert_eq!(
            map_api_error_to_discovery(status(401)).kind,
            DiscoveryErrorKind::Fatal
        );
        assert_eq!(
            map_api_error_to_discovery(status(404)).kind,
            DiscoveryErrorKind::Fatal
        );
    }

    #[test]
    fn detects_rate_limit_responses() {
        assert!(is_rate_limit_exceeded(429, None, ""));
        assert!(is_rate_limit_exceeded(403, None, "Rate Limit Exceeded"));
        assert!(!is_rate_limit_exceeded(403, None, "forbidden"));
        assert!(is_rate_limit_exceeded(403, Some("0"), "forbidden"));
        assert!(!is_rate_limit_exceeded(200, Some("0"), ""));
        assert!(!is_rate_limit_exceeded(500, Some("12"), ""));
    }

    #[test]
    fn parses_numeric_retry_after_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static(" 120 "));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("-3"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
