//! HTTP Digest access authentication (RFC 2617 / RFC 7616), client side.
//!
//! The gateway answers unauthenticated requests with
//! `WWW-Authenticate: Digest realm="..", nonce="..", qop="auth"`. The client
//! answers with an `Authorization` header whose `response` is a hash chain over
//! credentials, nonce, nonce counter and request line.

use anyhow::Result;

use crate::{error::GatewayError, util::cryptoutil};

/// Hash algorithm named in the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Ok(Algorithm::Md5),
            "MD5-SESS" => Ok(Algorithm::Md5Sess),
            "SHA-256" => Ok(Algorithm::Sha256),
            "SHA-256-SESS" => Ok(Algorithm::Sha256Sess),
            other => Err(GatewayError::Authentication(format!(
                "unsupported digest algorithm {}",
                other
            ))
            .into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_sess(&self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }

    pub fn hash(&self, data: &str) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => cryptoutil::md5_hex(data.as_bytes()),
            Algorithm::Sha256 | Algorithm::Sha256Sess => cryptoutil::sha256_hex(data.as_bytes()),
        }
    }
}

/// Parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    /// `Some("auth")` when the server offered it, `None` for legacy RFC 2069 digest.
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Algorithm,
    /// `algorithm` parameter was present; echoed back only in that case.
    pub algorithm_explicit: bool,
    pub stale: bool,
}

/// Split `k1="v1", k2=v2` into pairs. Commas inside quotes are kept.
fn parse_params(s: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let mut v = String::new();
            let mut chars = stripped.char_indices();
            let mut end = stripped.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, n)) = chars.next() {
                            v.push(n);
                        }
                    }
                    '"' => {
                        end = i + 1;
                        break;
                    }
                    _ => v.push(c),
                }
            }
            value = v;
            rest = &stripped[end.min(stripped.len())..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_owned();
            rest = &rest[end..];
        }
        rest = rest.trim_start().trim_start_matches(',').trim_start();
        out.push((key, value));
    }
    out
}

/// Parse a `WWW-Authenticate` header value.
pub fn parse_challenge(header: &str) -> Result<DigestChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
    if !scheme.eq_ignore_ascii_case("digest") {
        return Err(GatewayError::Authentication(format!(
            "expected digest challenge, got scheme {}",
            scheme
        ))
        .into());
    }
    let params = parse_params(params);
    let get = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let realm = get("realm")
        .ok_or_else(|| GatewayError::Authentication("digest challenge without realm".into()))?;
    let nonce = get("nonce")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| GatewayError::Authentication("digest challenge without nonce".into()))?;

    let qop = match get("qop") {
        None => None,
        Some(list) => {
            let offered: Vec<&str> = list.split(',').map(|q| q.trim()).collect();
            if offered.iter().any(|q| q.eq_ignore_ascii_case("auth")) {
                Some("auth".to_owned())
            } else {
                return Err(GatewayError::Authentication(format!(
                    "unsupported qop {}",
                    list
                ))
                .into());
            }
        }
    };
    let (algorithm, algorithm_explicit) = match get("algorithm") {
        Some(a) => (Algorithm::parse(&a)?, true),
        None => (Algorithm::Md5, false),
    };

    Ok(DigestChallenge {
        realm,
        nonce,
        qop,
        opaque: get("opaque"),
        algorithm,
        algorithm_explicit,
        stale: get("stale").is_some_and(|s| s.eq_ignore_ascii_case("true")),
    })
}

/// `HA1 = H(username:realm:password)`.
pub fn ha1(algorithm: Algorithm, username: &str, realm: &str, password: &str) -> String {
    algorithm.hash(&format!("{}:{}:{}", username, realm, password))
}

/// Everything besides credentials needed to answer one request.
#[derive(Debug, Clone)]
pub struct DigestParams<'a> {
    pub algorithm: Algorithm,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub qop: Option<&'a str>,
    pub nc: u32,
    pub cnonce: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
}

/// Compute the `response` value from a precomputed `H(username:realm:password)`.
pub fn compute_response_with_ha1(base_ha1: &str, p: &DigestParams) -> String {
    let h = p.algorithm;
    let ha1 = if h.is_sess() {
        h.hash(&format!("{}:{}:{}", base_ha1, p.nonce, p.cnonce))
    } else {
        base_ha1.to_owned()
    };
    let ha2 = h.hash(&format!("{}:{}", p.method, p.uri));
    match p.qop {
        Some(qop) => h.hash(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, p.nonce, p.nc, p.cnonce, qop, ha2
        )),
        None => h.hash(&format!("{}:{}:{}", ha1, p.nonce, ha2)),
    }
}

pub fn compute_response(username: &str, password: &str, p: &DigestParams) -> String {
    let base = ha1(p.algorithm, username, p.realm, password);
    compute_response_with_ha1(&base, p)
}

/// Build the `Authorization` header value.
pub fn authorization_header(
    username: &str,
    p: &DigestParams,
    response: &str,
    opaque: Option<&str>,
    algorithm_explicit: bool,
) -> String {
    let mut h = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}""#,
        username, p.realm, p.nonce, p.uri
    );
    if algorithm_explicit {
        h.push_str(&format!(", algorithm={}", p.algorithm.as_str()));
    }
    if let Some(qop) = p.qop {
        h.push_str(&format!(r#", qop={}, nc={:08x}, cnonce="{}""#, qop, p.nc, p.cnonce));
    }
    h.push_str(&format!(r#", response="{}""#, response));
    if let Some(opaque) = opaque {
        h.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    h
}

pub fn generate_cnonce() -> String {
    cryptoutil::random_hex(16)
}

/// Read `nextnonce` from an `Authentication-Info` header.
pub fn parse_next_nonce(authentication_info: &str) -> Option<String> {
    parse_params(authentication_info)
        .into_iter()
        .find(|(k, _)| k == "nextnonce")
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}
