//! Actions offered to the host and how they map to gateway requests.

use anyhow::{Context, Result};
use serde_json::json;

use crate::{
    auth,
    error::GatewayError,
    host::{ActionDefinition, OptionField, OptionValues},
    http::{self, HttpClient, HttpRequest, HttpResponse, Method},
    matrix::{MatrixVariables, DESTINATIONS, PRESETS, SOURCES},
    session::Session,
};

pub const ROUTE_SOURCE: &str = "route_source";
pub const CLEAR_ROUTE: &str = "clear_route";
pub const RECALL_PRESET: &str = "recall_preset";
pub const CUSTOM_REQUEST: &str = "custom_request";

pub const SET_ROUTE_PATH: &str = "/api/set_matrix_route";
pub const CLEAR_ROUTE_PATH: &str = "/api/clear_matrix_route";
pub const RECALL_PRESET_PATH: &str = "/api/recall_matrix_preset";

fn dropdown(id: &str, label: &str, vars: &MatrixVariables, kind: &str) -> OptionField {
    let choices = vars.choices(kind);
    OptionField::Dropdown {
        id: id.to_owned(),
        label: label.to_owned(),
        default: choices.first().map(|c| c.id.clone()),
        choices,
    }
}

/// Action descriptions; dropdowns list the discovered matrix features.
pub fn action_definitions(vars: &MatrixVariables) -> Vec<ActionDefinition> {
    vec![
        ActionDefinition {
            id: ROUTE_SOURCE.to_owned(),
            name: "Route source to destination".to_owned(),
            options: vec![
                dropdown("source", "Source", vars, SOURCES),
                dropdown("destination", "Destination", vars, DESTINATIONS),
            ],
        },
        ActionDefinition {
            id: CLEAR_ROUTE.to_owned(),
            name: "Clear destination route".to_owned(),
            options: vec![dropdown("destination", "Destination", vars, DESTINATIONS)],
        },
        ActionDefinition {
            id: RECALL_PRESET.to_owned(),
            name: "Recall matrix preset".to_owned(),
            options: vec![dropdown("preset", "Preset", vars, PRESETS)],
        },
        ActionDefinition {
            id: CUSTOM_REQUEST.to_owned(),
            name: "Send custom API request".to_owned(),
            options: vec![
                OptionField::TextInput {
                    id: "method".to_owned(),
                    label: "Method (GET/POST)".to_owned(),
                    default: "POST".to_owned(),
                },
                OptionField::TextInput {
                    id: "path".to_owned(),
                    label: "Path".to_owned(),
                    default: "/api/".to_owned(),
                },
                OptionField::TextInput {
                    id: "body".to_owned(),
                    label: "JSON body".to_owned(),
                    default: String::new(),
                },
            ],
        },
    ]
}

/// Validated action ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionCommand {
    Route { source: String, destination: String },
    ClearRoute { destination: String },
    RecallPreset { preset: String },
    Custom {
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    },
}

fn option<'a>(options: &'a OptionValues, name: &str) -> Result<&'a str> {
    options
        .get(name)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Action(format!("option '{}' missing", name)).into())
}

fn known<'a>(vars: &MatrixVariables, kind: &str, value: &'a str) -> Result<&'a str> {
    if vars.contains(kind, value) {
        Ok(value)
    } else {
        Err(GatewayError::Action(format!("'{}' is not one of the gateway {}", value, kind)).into())
    }
}

impl ActionCommand {
    /// Build from host option values, checking choices against the current features.
    pub fn parse(id: &str, options: &OptionValues, vars: &MatrixVariables) -> Result<Self> {
        match id {
            ROUTE_SOURCE => Ok(ActionCommand::Route {
                source: known(vars, SOURCES, option(options, "source")?)?.to_owned(),
                destination: known(vars, DESTINATIONS, option(options, "destination")?)?.to_owned(),
            }),
            CLEAR_ROUTE => Ok(ActionCommand::ClearRoute {
                destination: known(vars, DESTINATIONS, option(options, "destination")?)?.to_owned(),
            }),
            RECALL_PRESET => Ok(ActionCommand::RecallPreset {
                preset: known(vars, PRESETS, option(options, "preset")?)?.to_owned(),
            }),
            CUSTOM_REQUEST => {
                let method = match options.get("method").map(|m| m.trim().to_ascii_uppercase()) {
                    None => Method::Post,
                    Some(m) if m.is_empty() || m == "POST" => Method::Post,
                    Some(m) if m == "GET" => Method::Get,
                    Some(m) => {
                        return Err(GatewayError::Action(format!("unsupported method {}", m)).into())
                    }
                };
                let raw = option(options, "path")?.trim();
                if !raw.starts_with('/') {
                    return Err(GatewayError::Action(format!("path '{}' must start with /", raw)).into());
                }
                let path = http::wire_path("http://gateway", raw).map_err(|e| {
                    GatewayError::Action(format!("path '{}' is not usable: {:#}", raw, e))
                })?;
                let body = match options.get("body").map(|b| b.trim()).filter(|b| !b.is_empty()) {
                    Some(b) => Some(
                        serde_json::from_str(b)
                            .map_err(|e| GatewayError::Action(format!("body is not json: {}", e)))?,
                    ),
                    None => None,
                };
                Ok(ActionCommand::Custom { method, path, body })
            }
            other => Err(GatewayError::Action(format!("unknown action {}", other)).into()),
        }
    }

    pub fn method(&self) -> Method {
        match self {
            ActionCommand::Custom { method, .. } => *method,
            _ => Method::Post,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ActionCommand::Route { .. } => SET_ROUTE_PATH,
            ActionCommand::ClearRoute { .. } => CLEAR_ROUTE_PATH,
            ActionCommand::RecallPreset { .. } => RECALL_PRESET_PATH,
            ActionCommand::Custom { path, .. } => path.as_str(),
        }
    }

    pub fn body(&self) -> Option<serde_json::Value> {
        match self {
            ActionCommand::Route { source, destination } => {
                Some(json!({"source": source, "destination": destination}))
            }
            ActionCommand::ClearRoute { destination } => Some(json!({"destination": destination})),
            ActionCommand::RecallPreset { preset } => Some(json!({"preset": preset})),
            ActionCommand::Custom { body, .. } => body.clone(),
        }
    }

    /// Build the request. Reserves the next nonce count on `session`.
    pub fn request(&self, session: &mut Session, base_url: &str) -> HttpRequest {
        let method = self.method();
        let mut request = HttpRequest::new(method, base_url, self.path())
            .with_headers(session.request_headers(method, self.path()));
        if let Some(body) = self.body() {
            request = request.with_json(&body);
        }
        request
    }
}

/// Send a prepared action request.
pub async fn send_action(client: &dyn HttpClient, request: HttpRequest) -> Result<HttpResponse> {
    let path = request.path.clone();
    let response = client
        .send(request)
        .await
        .context(format!("sending action {}", path))?;
    match response.status {
        401 | 403 => auth::check_authenticated(&response)?,
        s if !(200..300).contains(&s) => {
            return Err(GatewayError::Action(format!("{} answered status {}", path, s)).into())
        }
        _ => {}
    }
    Ok(response)
}
