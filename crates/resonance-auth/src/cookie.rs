//! Cookie transport for session tokens.

use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use httpdate::fmt_http_date;

use crate::{Error, Result};

const HOST_PREFIX: &str = "__Host-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl std::str::FromStr for SameSite {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            other => Err(Error::Config(format!("unknown SameSite value {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CookieOptions {
    /// Name without any prefix.
    pub name: String,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// Prefix the name with `__Host-` when no domain is set. Requires `Path=/` and `Secure`.
    pub use_host_prefix: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            name: "resonance_session".to_string(),
            path: "/".to_string(),
            domain: None,
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            use_host_prefix: true,
        }
    }
}

impl CookieOptions {
    /// The name as it appears on the wire.
    pub fn effective_name(&self) -> Result<String> {
        let bare = self.name.trim_start_matches(HOST_PREFIX);
        if bare.is_empty() || bare.contains(|c: char| c == '=' || c == ';' || c.is_whitespace()) {
            return Err(Error::Config(format!("invalid cookie name {:?}", self.name)));
        }
        if !(self.use_host_prefix && self.domain.is_none()) {
            return Ok(bare.to_string());
        }
        if self.path != "/" {
            return Err(Error::Config("__Host- cookies must have Path=/".to_string()));
        }
        if !self.secure {
            return Err(Error::Config("__Host- cookies must be Secure".to_string()));
        }
        Ok(format!("{HOST_PREFIX}{bare}"))
    }

    fn write_attributes(&self, out: &mut String) {
        let _ = write!(out, "; Path={}", self.path);
        if let Some(domain) = &self.domain {
            let _ = write!(out, "; Domain={domain}");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        let _ = write!(out, "; SameSite={}", self.same_site.as_str());
    }
}

/// `Set-Cookie` value carrying a token. `max_age` should match the token's lifetime.
pub fn build_set_cookie(value: &str, max_age: Duration, opts: &CookieOptions) -> Result<String> {
    let mut out = format!("{}={value}", opts.effective_name()?);
    opts.write_attributes(&mut out);
    let _ = write!(
        out,
        "; Max-Age={}; Expires={}",
        max_age.as_secs(),
        fmt_http_date(SystemTime::now() + max_age)
    );
    Ok(out)
}

/// `Set-Cookie` value that makes the client drop the cookie.
pub fn build_clear_cookie(opts: &CookieOptions) -> Result<String> {
    let mut out = format!("{}=", opts.effective_name()?);
    opts.write_attributes(&mut out);
    let _ = write!(out, "; Max-Age=0; Expires={}", fmt_http_date(UNIX_EPOCH));
    Ok(out)
}

/// Find `name` in a `Cookie` request header.
pub fn read_cookie<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
        .filter(|v| !v.is_empty())
}
