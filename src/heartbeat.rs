//! Session keepalive.
//!
//! The gateway forgets a digest session after roughly a minute without
//! traffic. A cheap authenticated probe every [HEARTBEAT_INTERVAL] keeps it
//! alive; the response may carry a new CSRF token or `nextnonce` which the
//! owner of the [Session] adopts via [Session::apply_refresh].

use std::time::Duration;

use anyhow::{Context, Result};

use crate::{
    auth::{self, PROBE_PATH},
    http::{HttpClient, HttpRequest, HttpResponse, Method},
    session::Session,
};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Build the keepalive request. Reserves the next nonce count on `session`.
pub fn heartbeat_request(session: &mut Session, base_url: &str) -> HttpRequest {
    HttpRequest::new(Method::Get, base_url, PROBE_PATH)
        .with_headers(session.request_headers(Method::Get, PROBE_PATH))
}

/// Send a prepared keepalive request. Returns the response for the session
/// refresh; any non-2xx is an authentication failure.
pub async fn send_heartbeat(client: &dyn HttpClient, request: HttpRequest) -> Result<HttpResponse> {
    let response = client.send(request).await.context("sending heartbeat")?;
    auth::check_authenticated(&response).context("heartbeat rejected")?;
    log::trace!("heartbeat ok");
    Ok(response)
}
