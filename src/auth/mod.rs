//! Authentication headers for outgoing requests.
//!
//! The download manager asks an [`AuthProvider`] for headers before every
//! fetch attempt. Providers are synchronous and cheap; anything expensive
//! (reading a cookie file) happens once at construction.

mod cookies;

use std::path::Path;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{COOKIE, HeaderMap};
use tracing::{info, instrument, warn};
use url::Url;

pub use cookies::{
    CookieError, CookieLine, ParseResult, load_cookies_into_jar, parse_netscape_cookies,
};

/// Supplies request headers (cookies, User-Agent, ...) for a URL.
pub trait AuthProvider: Send + Sync {
    /// Returns the headers to attach to a request for `url`.
    fn headers_for(&self, url: &Url) -> HeaderMap;
}

/// Sends no extra headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn headers_for(&self, _url: &Url) -> HeaderMap {
        HeaderMap::new()
    }
}

/// Sends the same headers with every request.
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders {
    headers: HeaderMap,
}

impl StaticHeaders {
    /// Wraps a fixed header set.
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }
}

impl AuthProvider for StaticHeaders {
    fn headers_for(&self, _url: &Url) -> HeaderMap {
        self.headers.clone()
    }
}

/// Cookies from a Netscape cookie file plus optional static headers.
///
/// The cookies live in a `reqwest` jar, which picks the ones that apply to
/// each request URL.
#[derive(Debug, Default)]
pub struct CookieFileAuth {
    jar: Jar,
    cookie_count: usize,
    extra: HeaderMap,
}

impl CookieFileAuth {
    /// Creates a provider from already-parsed cookies.
    #[must_use]
    pub fn new(cookies: &[CookieLine]) -> Self {
        Self {
            jar: load_cookies_into_jar(cookies),
            cookie_count: cookies.len(),
            extra: HeaderMap::new(),
        }
    }

    /// Loads cookies from a Netscape-format file.
    ///
    /// # Errors
    ///
    /// Returns [`CookieError::Open`] if the file cannot be opened, and the
    /// parser's errors otherwise.
    #[instrument(fields(path = %path.display()))]
    pub fn from_file(path: &Path) -> Result<Self, CookieError> {
        let file = std::fs::File::open(path).map_err(|source| CookieError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = parse_netscape_cookies(std::io::BufReader::new(file))?;
        if !parsed.warnings.is_empty() {
            warn!(skipped = parsed.warnings.len(), "some cookie lines were skipped");
        }
        info!(cookies = parsed.cookies.len(), "loaded cookie file");
        Ok(Self::new(&parsed.cookies))
    }

    /// Adds headers sent with every request (e.g. a browser User-Agent).
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.extra.extend(headers);
        self
    }

    /// Number of cookies read from the file, expired ones included.
    #[must_use]
    pub fn cookie_count(&self) -> usize {
        self.cookie_count
    }
}

impl AuthProvider for CookieFileAuth {
    fn headers_for(&self, url: &Url) -> HeaderMap {
        let mut headers = self.extra.clone();
        if let Some(mut value) = self.jar.cookies(url) {
            value.set_sensitive(true);
            headers.insert(COOKIE, value);
        }
        headers
    }
}
