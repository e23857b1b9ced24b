//! Visitor cookies: `uuid` (context), `last` (last short code) and one visit counter per
//! short code, named `c_{code}`.

use axum::http::{header, HeaderMap, HeaderValue};
use cookie::{time::Duration, Cookie, SameSite};
use std::collections::HashMap;

use crate::attribution::CookieState;
use crate::config::CookieConfig;

pub const CONTEXT_COOKIE: &str = "uuid";
pub const LAST_CODE_COOKIE: &str = "last";
/// Counter cookies live under their own prefix so no short code can shadow `uuid` or `last`
pub const VISIT_COOKIE_PREFIX: &str = "c_";

pub fn visit_cookie_name(code: &str) -> String {
    format!("{VISIT_COOKIE_PREFIX}{code}")
}

/// Cookies sent with a request.
#[derive(Debug, Clone, Default)]
pub struct RequestCookies(HashMap<String, String>);

impl RequestCookies {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cookies = HashMap::new();
        for value in headers.get_all(header::COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            for cookie in Cookie::split_parse(raw).flatten() {
                cookies
                    .entry(cookie.name().to_string())
                    .or_insert_with(|| cookie.value().to_string());
            }
        }
        Self(cookies)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn context(&self) -> Option<&str> {
        self.get(CONTEXT_COOKIE)
    }

    pub fn last_code(&self) -> Option<&str> {
        self.get(LAST_CODE_COOKIE)
    }

    /// Visits to `code` counted so far; garbage counts as zero.
    pub fn visits(&self, code: &str) -> u64 {
        self.get(&visit_cookie_name(code))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    }

    pub fn state_for(&self, code: &str) -> CookieState {
        CookieState {
            context: self.context().map(str::to_string),
            visits: self.visits(code),
        }
    }
}

/// Builds `Set-Cookie` headers with the configured attributes.
#[derive(Debug, Clone)]
pub struct CookieWriter {
    max_age: Duration,
    domain: Option<String>,
    secure: bool,
}

impl CookieWriter {
    pub fn new(config: &CookieConfig) -> Self {
        Self {
            max_age: Duration::days(config.max_age_days),
            domain: config.domain.clone(),
            secure: config.secure,
        }
    }

    fn build(&self, name: &str, value: &str) -> Cookie<'static> {
        let mut cookie = Cookie::new(name.to_string(), value.to_string());
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_secure(self.secure);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_max_age(self.max_age);
        if let Some(ref domain) = self.domain {
            cookie.set_domain(domain.clone());
        }
        cookie
    }

    fn append(&self, headers: &mut HeaderMap, name: &str, value: &str) {
        match HeaderValue::from_str(&self.build(name, value).to_string()) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(err) => tracing::warn!(cookie = name, error = %err, "unrepresentable cookie"),
        }
    }

    pub fn set_context(&self, headers: &mut HeaderMap, context: &str) {
        self.append(headers, CONTEXT_COOKIE, context);
    }

    /// Context, last short code and the visit counter after a short-link visit.
    pub fn set_visit(&self, headers: &mut HeaderMap, context: &str, code: &str, visit_count: u64) {
        self.set_context(headers, context);
        self.append(headers, LAST_CODE_COOKIE, code);
        self.append(headers, &visit_cookie_name(code), &visit_count.to_string());
    }
}
