use anyhow::{Context, Result};

use crate::{
    config::GatewayConfig,
    digest,
    error::GatewayError,
    http::{HttpClient, HttpRequest, HttpResponse, Method},
    session::{CsrfToken, Session},
};

/// Lightweight endpoint used for the login probe and the keepalive.
pub const PROBE_PATH: &str = "/api/get_system_info";

/// Log in to the gateway.
/// - send unauthenticated probe
/// - answer the digest challenge from the 401
/// - keep the CSRF token returned with the authenticated response
pub async fn authenticate(client: &dyn HttpClient, config: &GatewayConfig) -> Result<Session> {
    let base = config.base_url();
    log::debug!("authenticating against {}", base);

    let probe = client
        .send(HttpRequest::new(Method::Get, &base, PROBE_PATH))
        .await
        .context("sending auth probe")?;

    if probe.is_success() {
        log::info!("gateway {} does not require authentication", config.host);
        let mut session = Session::open(&config.username);
        session.set_csrf(CsrfToken::from_response(&probe));
        return Ok(session);
    }
    if probe.status != 401 {
        return Err(GatewayError::Authentication(format!(
            "unexpected status {} to auth probe",
            probe.status
        ))
        .into());
    }

    let challenge = probe
        .header_all("WWW-Authenticate")
        .find(|h| h.trim_start().to_ascii_lowercase().starts_with("digest"))
        .ok_or_else(|| GatewayError::Authentication("401 without digest challenge".into()))?;
    let challenge = digest::parse_challenge(challenge)?;
    log::debug!(
        "digest challenge realm:{} qop:{:?} algorithm:{}",
        challenge.realm,
        challenge.qop,
        challenge.algorithm.as_str()
    );

    let mut session = Session::from_challenge(&challenge, &config.username, &config.password);
    let request = HttpRequest::new(Method::Get, &base, PROBE_PATH)
        .with_headers(session.request_headers(Method::Get, PROBE_PATH));
    let response = client
        .send(request)
        .await
        .context("sending authenticated probe")?;
    check_authenticated(&response)?;

    session.set_csrf(CsrfToken::from_response(&response));
    session.apply_refresh(&response);
    log::info!(
        "authenticated to {} as {} (csrf token {})",
        config.host,
        config.username,
        if session.csrf_token().is_some() { "present" } else { "absent" }
    );
    Ok(session)
}

/// Map the status of an authenticated request to an error kind.
pub(crate) fn check_authenticated(response: &HttpResponse) -> Result<()> {
    match response.status {
        s if (200..300).contains(&s) => Ok(()),
        401 => Err(GatewayError::Authentication("credentials rejected".into()).into()),
        403 => Err(GatewayError::Authentication("access forbidden".into()).into()),
        s => Err(GatewayError::Authentication(format!("unexpected status {}", s)).into()),
    }
}
