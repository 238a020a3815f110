//! Matrix routing features of the gateway.
//!
//! `GET /api/get_matrix_features` answers with a JSON object mapping a
//! capability type to its entries, e.g.
//! `{"sources": ["Mic 1", {"name": "Codec A"}], "destinations": [...]}`.
//! The whole answer is accepted or rejected; a partially understood feature
//! set is never installed.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    auth,
    config::GatewayConfig,
    error::GatewayError,
    http::{HttpClient, HttpRequest, Method},
    session::Session,
};

pub const MATRIX_FEATURES_PATH: &str = "/api/get_matrix_features";

pub const SOURCES: &str = "sources";
pub const DESTINATIONS: &str = "destinations";
pub const PRESETS: &str = "presets";

/// Dropdown entry offered to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub id: String,
    pub label: String,
}

impl Choice {
    pub fn new(value: &str) -> Self {
        Self {
            id: value.to_owned(),
            label: value.to_owned(),
        }
    }
}

/// Capability type -> ordered values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixVariables {
    entries: BTreeMap<String, Vec<String>>,
}

impl MatrixVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: &str, values: Vec<String>) {
        self.entries.insert(kind.to_owned(), values);
    }

    pub fn get(&self, kind: &str) -> Option<&[String]> {
        self.entries.get(kind).map(|v| v.as_slice())
    }

    pub fn contains(&self, kind: &str, value: &str) -> bool {
        self.get(kind).is_some_and(|v| v.iter().any(|x| x == value))
    }

    pub fn choices(&self, kind: &str) -> Vec<Choice> {
        self.get(kind)
            .map(|values| values.iter().map(|v| Choice::new(v)).collect())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse the feature document.
    pub fn from_json(body: &str) -> Result<Self> {
        let doc: BTreeMap<String, Vec<FeatureEntry>> = serde_json::from_str(body).map_err(|e| {
            GatewayError::FeatureDiscovery(format!("matrix features not understood: {}", e))
        })?;
        let mut vars = Self::new();
        for (kind, entries) in doc {
            let values = entries
                .iter()
                .map(|entry| {
                    entry.name().ok_or_else(|| {
                        GatewayError::FeatureDiscovery(format!(
                            "unnamed entry in feature '{}'",
                            kind
                        ))
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            vars.insert(&kind, values);
        }
        Ok(vars)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(serde_json::Number),
}

impl Scalar {
    fn to_text(&self) -> String {
        match self {
            Scalar::Text(s) => s.clone(),
            Scalar::Number(n) => n.to_string(),
        }
    }
}

/// Entry of a feature list: a bare value or an object naming it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeatureEntry {
    Value(Scalar),
    Named {
        name: Option<Scalar>,
        label: Option<Scalar>,
        id: Option<Scalar>,
    },
}

impl FeatureEntry {
    fn name(&self) -> Option<String> {
        match self {
            FeatureEntry::Value(v) => Some(v.to_text()),
            FeatureEntry::Named { name, label, id } => {
                name.as_ref().or(label.as_ref()).or(id.as_ref()).map(Scalar::to_text)
            }
        }
    }
}

/// Query the gateway's routing capabilities with an authenticated request.
pub async fn fetch_matrix_features(
    client: &dyn HttpClient,
    config: &GatewayConfig,
    session: &mut Session,
) -> Result<MatrixVariables> {
    let request = HttpRequest::new(Method::Get, &config.base_url(), MATRIX_FEATURES_PATH)
        .with_headers(session.request_headers(Method::Get, MATRIX_FEATURES_PATH));
    let response = client
        .send(request)
        .await
        .context("requesting matrix features")?;
    if response.status == 401 || response.status == 403 {
        auth::check_authenticated(&response)?;
    }
    if !response.is_success() {
        return Err(GatewayError::FeatureDiscovery(format!(
            "status {} from {}",
            response.status, MATRIX_FEATURES_PATH
        ))
        .into());
    }
    session.apply_refresh(&response);
    let vars = MatrixVariables::from_json(&response.body)?;
    log::info!(
        "matrix features: {}",
        vars.iter()
            .map(|(k, v)| format!("{}={}", k, v.len()))
            .collect::<Vec<_>>()
            .join(" ")
    );
    Ok(vars)
}
