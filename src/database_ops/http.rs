// -------- HTTP status classification shared by the catalog adapters --------
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

use crate::error::SourceError;

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Map a non-success response to the error the sync engine expects; `None` for 2xx.
pub fn status_error(status: StatusCode, headers: &HeaderMap) -> Option<SourceError> {
    if status.is_success() {
        return None;
    }
    let err = match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::Throttled {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(parse_retry_after),
        },
        // Steam answers 403 instead of 429 once a client has been hammering it
        StatusCode::FORBIDDEN => SourceError::Throttled { retry_after: None },
        StatusCode::NOT_FOUND | StatusCode::GONE => SourceError::NotFound,
        s => SourceError::Unavailable(format!("http {}", s.as_u16())),
    };
    Some(err)
}
