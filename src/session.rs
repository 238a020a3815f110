use std::time::SystemTime;

use crate::{
    digest::{self, Algorithm, DigestChallenge, DigestParams},
    http::{HttpResponse, Method},
};

pub const CSRF_HEADER: &str = "X-CSRF-Token";
const CSRF_RESPONSE_HEADERS: [&str; 3] = ["X-CSRF-Token", "X-XSRF-Token", "CSRF-Token"];

/// Anti-forgery token handed out by the gateway after login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfToken {
    pub value: String,
    /// Set when the token arrived as a cookie; it is then echoed as cookie too.
    pub cookie_name: Option<String>,
}

impl CsrfToken {
    /// Look for a token in response headers first, then in `Set-Cookie`.
    pub fn from_response(resp: &HttpResponse) -> Option<Self> {
        for name in CSRF_RESPONSE_HEADERS {
            if let Some(v) = resp.header(name).map(str::trim).filter(|v| !v.is_empty()) {
                return Some(Self {
                    value: v.to_owned(),
                    cookie_name: None,
                });
            }
        }
        resp.header_all("Set-Cookie").find_map(|cookie| {
            let pair = cookie.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let (name, value) = (name.trim(), value.trim().trim_matches('"'));
            let lower = name.to_ascii_lowercase();
            if (lower.contains("csrf") || lower.contains("xsrf")) && !value.is_empty() {
                Some(Self {
                    value: value.to_owned(),
                    cookie_name: Some(name.to_owned()),
                })
            } else {
                None
            }
        })
    }
}

#[derive(Debug, Clone)]
struct DigestState {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
    algorithm: Algorithm,
    algorithm_explicit: bool,
    /// H(username:realm:password); the password itself is not kept.
    ha1: String,
    cnonce: String,
    /// Last nonce count used with `nonce`.
    nc: u32,
}

/// Authenticated session with the gateway.
///
/// Every authenticated request must take its `Authorization` header from
/// [Session::authorize], which advances the nonce count. A count is never
/// reused for the same nonce.
#[derive(Debug, Clone)]
pub struct Session {
    username: String,
    digest: Option<DigestState>,
    auth_header: Option<String>,
    csrf: Option<CsrfToken>,
    last_auth: SystemTime,
}

impl Session {
    pub fn from_challenge(challenge: &DigestChallenge, username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            digest: Some(DigestState {
                realm: challenge.realm.clone(),
                nonce: challenge.nonce.clone(),
                qop: challenge.qop.clone(),
                opaque: challenge.opaque.clone(),
                algorithm: challenge.algorithm,
                algorithm_explicit: challenge.algorithm_explicit,
                ha1: digest::ha1(challenge.algorithm, username, &challenge.realm, password),
                cnonce: digest::generate_cnonce(),
                nc: 0,
            }),
            auth_header: None,
            csrf: None,
            last_auth: SystemTime::now(),
        }
    }

    /// Session for a gateway which answered the probe without a challenge.
    pub fn open(username: &str) -> Self {
        Self {
            username: username.to_owned(),
            digest: None,
            auth_header: None,
            csrf: None,
            last_auth: SystemTime::now(),
        }
    }

    /// Advance the nonce count and build the `Authorization` header for one request.
    pub fn authorize(&mut self, method: Method, uri: &str) -> Option<String> {
        let d = self.digest.as_mut()?;
        d.nc += 1;
        let params = DigestParams {
            algorithm: d.algorithm,
            realm: &d.realm,
            nonce: &d.nonce,
            qop: d.qop.as_deref(),
            nc: d.nc,
            cnonce: &d.cnonce,
            method: method.as_str(),
            uri,
        };
        let response = digest::compute_response_with_ha1(&d.ha1, &params);
        let header = digest::authorization_header(
            &self.username,
            &params,
            &response,
            d.opaque.as_deref(),
            d.algorithm_explicit,
        );
        log::trace!("authorize {} {} nc={:08x}", method, uri, d.nc);
        self.auth_header = Some(header.clone());
        Some(header)
    }

    /// Headers for the next authenticated request: authorization, plus the
    /// CSRF echo for state changing methods.
    pub fn request_headers(&mut self, method: Method, path: &str) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(auth) = self.authorize(method, path) {
            headers.push(("Authorization".to_owned(), auth));
        }
        if method.is_state_changing() {
            if let Some(token) = &self.csrf {
                headers.push((CSRF_HEADER.to_owned(), token.value.clone()));
                if let Some(cookie) = &token.cookie_name {
                    headers.push(("Cookie".to_owned(), format!("{}={}", cookie, token.value)));
                }
            }
        }
        headers
    }

    /// Adopt a refreshed CSRF token or `nextnonce` from a response.
    /// Returns true when anything changed.
    pub fn apply_refresh(&mut self, resp: &HttpResponse) -> bool {
        let mut changed = false;
        if let Some(token) = CsrfToken::from_response(resp) {
            if self.csrf.as_ref() != Some(&token) {
                log::debug!("csrf token refreshed");
                self.csrf = Some(token);
                changed = true;
            }
        }
        if let (Some(d), Some(next)) = (
            self.digest.as_mut(),
            resp.header("Authentication-Info").and_then(digest::parse_next_nonce),
        ) {
            if next != d.nonce {
                log::debug!("server rotated nonce");
                d.nonce = next;
                d.nc = 0;
                changed = true;
            }
        }
        if changed {
            self.last_auth = SystemTime::now();
        }
        changed
    }

    pub fn set_csrf(&mut self, token: Option<CsrfToken>) {
        self.csrf = token;
    }

    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Nonce count of the last authenticated request (0 before the first).
    pub fn nc(&self) -> u32 {
        self.digest.as_ref().map(|d| d.nc).unwrap_or(0)
    }

    pub fn realm(&self) -> Option<&str> {
        self.digest.as_ref().map(|d| d.realm.as_str())
    }

    pub fn nonce(&self) -> Option<&str> {
        self.digest.as_ref().map(|d| d.nonce.as_str())
    }

    pub fn auth_header(&self) -> Option<&str> {
        self.auth_header.as_deref()
    }

    pub fn csrf_token(&self) -> Option<&str> {
        self.csrf.as_ref().map(|t| t.value.as_str())
    }

    pub fn last_auth(&self) -> SystemTime {
        self.last_auth
    }
}
