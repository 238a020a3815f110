//! Tieline gateway control library
//!
//! This library connects a broadcast-control host to a Tieline audio gateway over its HTTP API.
//! Library uses asynchronous Rust and depends on Tokio.
//! Following are main parts of api:
//! - [GatewayInstance](instance::GatewayInstance) - one controlled gateway. Owns the connection state machine:
//!                             digest login, matrix feature discovery, 30 s keepalive and
//!                             exponential reconnect. Lifecycle calls are [init](instance::GatewayInstance::init),
//!                             [config_updated](instance::GatewayInstance::config_updated) and [destroy](instance::GatewayInstance::destroy).
//! - [ModuleHost](host::ModuleHost) - Trait through which status, action/feedback/variable definitions
//!                             and variable values reach the host runtime. [LogHost](host::LogHost) only logs.
//! - [HttpClient](http::HttpClient) - Transport seam. Default implementation [ReqwestClient](http::ReqwestClient).
//! - [Session](session::Session) - digest credentials, nonce count and CSRF token of a logged in connection.
//! - [digest] - RFC 2617/7616 challenge parsing and response computation (MD5, MD5-sess, SHA-256).
//! - [config] - settings with validation and the field descriptions shown in the host config form.
//!
//! Example running an instance against a gateway, logging everything:
//! ```no_run
//! # use std::sync::Arc;
//! # use anyhow::Result;
//! # use tieline_gw::{config::GatewayConfig, host::LogHost, instance::GatewayInstance};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let instance = GatewayInstance::spawn(Arc::new(LogHost));
//! instance.init(GatewayConfig::new("192.168.5.70", "admin", "password"))?;
//! // route a source once connected
//! let options = [("source", "Codec A"), ("destination", "PGM")]
//!     .iter()
//!     .map(|(k, v)| (k.to_string(), v.to_string()))
//!     .collect();
//! instance.execute_action("route_source", options).await?;
//! instance.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod auth;
pub mod config;
pub mod digest;
pub mod error;
pub mod feedbacks;
pub mod heartbeat;
pub mod host;
pub mod http;
pub mod instance;
pub mod matrix;
pub mod reconnect;
pub mod session;
pub mod timer;
mod util;
pub mod variables;
