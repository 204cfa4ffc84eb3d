use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};

use crate::types::UpstreamError;

/// Header carrying the upstream anti-bot token.
pub const TOKEN_HEADER: &str = "bx-umidtoken";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Holds the two opaque strings every upstream call requires. Loaded once at
/// startup; there is no runtime rotation.
#[derive(Debug, Clone)]
pub struct UpstreamCredentials {
    token: String,
    cookie: String,
}

impl UpstreamCredentials {
    pub fn new(token: impl Into<String>, cookie: impl Into<String>) -> Result<Self, UpstreamError> {
        let token = token.into();
        let cookie = cookie.into();
        if token.trim().is_empty() {
            return Err(UpstreamError::InvalidResponse(
                "upstream token must be non-empty".to_string(),
            ));
        }
        if cookie.trim().is_empty() {
            return Err(UpstreamError::InvalidResponse(
                "upstream cookie must be non-empty".to_string(),
            ));
        }
        Ok(Self { token, cookie })
    }

    /// The fixed header set every upstream call requires. Omitting any of
    /// these provokes the HTML anti-bot challenge.
    pub fn headers(&self) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(
            TOKEN_HEADER,
            HeaderValue::from_str(self.token.trim()).map_err(|error| {
                UpstreamError::InvalidResponse(format!("invalid token header value: {error}"))
            })?,
        );
        headers.insert(
            COOKIE,
            HeaderValue::from_str(self.cookie.trim()).map_err(|error| {
                UpstreamError::InvalidResponse(format!("invalid cookie header value: {error}"))
            })?,
        );
        Ok(headers)
    }

    /// Prefix-only preview for diagnostics. Full values never leave this
    /// struct.
    pub fn token_preview(&self) -> String {
        preview(&self.token)
    }

    pub fn cookie_preview(&self) -> String {
        preview(&self.cookie)
    }
}

fn preview(value: &str) -> String {
    let prefix: String = value.chars().take(8).collect();
    format!("{prefix}…")
}
