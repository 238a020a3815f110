use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    host::{Choice, InstanceStatus, VariableDefinition},
    matrix::MatrixVariables,
};

pub const CONNECTION_STATUS: &str = "connection_status";
pub const RECONNECT_ATTEMPTS: &str = "reconnect_attempts";
pub const DEVICE_HOST: &str = "device_host";
pub const LAST_AUTH_TIME: &str = "last_auth_time";

fn count_id(kind: &str) -> String {
    format!("{}_count", kind)
}

fn list_id(kind: &str) -> String {
    format!("{}_list", kind)
}

pub fn variable_definitions(vars: &MatrixVariables) -> Vec<VariableDefinition> {
    let mut defs: Vec<VariableDefinition> = [
        (CONNECTION_STATUS, "Connection status"),
        (RECONNECT_ATTEMPTS, "Reconnect attempts since last success"),
        (DEVICE_HOST, "Gateway host"),
        (LAST_AUTH_TIME, "Last authentication (unix seconds)"),
    ]
    .iter()
    .map(|(id, name)| VariableDefinition {
        id: id.to_string(),
        name: name.to_string(),
    })
    .collect();
    for kind in vars.kinds() {
        defs.push(VariableDefinition {
            id: count_id(kind),
            name: format!("Number of matrix {}", kind),
        });
        defs.push(VariableDefinition {
            id: list_id(kind),
            name: format!("Matrix {}", kind),
        });
    }
    defs
}

/// Status variables; always published.
pub fn status_values(
    status: InstanceStatus,
    attempts: u32,
    host: &str,
    last_auth: Option<SystemTime>,
) -> HashMap<String, String> {
    let mut values = HashMap::new();
    values.insert(CONNECTION_STATUS.to_owned(), status.to_string());
    values.insert(RECONNECT_ATTEMPTS.to_owned(), attempts.to_string());
    values.insert(DEVICE_HOST.to_owned(), host.to_owned());
    let last = last_auth
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default();
    values.insert(LAST_AUTH_TIME.to_owned(), last);
    values
}

/// Per-capability variables for a freshly discovered feature set.
pub fn matrix_values(vars: &MatrixVariables) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for (kind, list) in vars.iter() {
        values.insert(count_id(kind), list.len().to_string());
        values.insert(list_id(kind), list.join(", "));
    }
    values
}

/// Empty values for capability types `previous` had and `current` lacks.
pub fn removed_matrix_values(
    previous: &MatrixVariables,
    current: &MatrixVariables,
) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for kind in previous.kinds().filter(|k| current.get(k).is_none()) {
        values.insert(count_id(kind), String::new());
        values.insert(list_id(kind), String::new());
    }
    values
}

/// Choices for a capability type, empty (with a warning) when the gateway
/// reported none.
pub fn get_variable_choices(vars: &MatrixVariables, kind: &str) -> Vec<Choice> {
    let choices = vars.choices(kind);
    if choices.is_empty() {
        log::warn!("no matrix values available for '{}'", kind);
    }
    choices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn vars() -> MatrixVariables {
        let mut v = MatrixVariables::new();
        v.insert("sources", vec!["A".into(), "B".into()]);
        v.insert("destinations", vec![]);
        v
    }

    #[test]
    fn variable_choices() {
        assert_eq!(
            get_variable_choices(&vars(), "sources"),
            vec![
                Choice { id: "A".into(), label: "A".into() },
                Choice { id: "B".into(), label: "B".into() }
            ]
        );
        assert!(get_variable_choices(&vars(), "presets").is_empty());
        assert!(get_variable_choices(&vars(), "destinations").is_empty());
    }

    #[test]
    fn definitions_and_values() {
        let defs = variable_definitions(&vars());
        let ids: Vec<_> = defs.iter().map(|d| d.id.as_str()).collect();
        assert!(ids.contains(&"sources_count"));
        assert!(ids.contains(&"destinations_list"));
        assert!(ids.contains(&CONNECTION_STATUS));

        let m = matrix_values(&vars());
        assert_eq!(m["sources_count"], "2");
        assert_eq!(m["sources_list"], "A, B");
        assert_eq!(m["destinations_count"], "0");

        let s = status_values(
            InstanceStatus::Ok,
            0,
            "10.0.0.5",
            Some(UNIX_EPOCH + Duration::from_secs(1700000000)),
        );
        assert_eq!(s[CONNECTION_STATUS], "ok");
        assert_eq!(s[RECONNECT_ATTEMPTS], "0");
        assert_eq!(s[LAST_AUTH_TIME], "1700000000");
        assert_eq!(status_values(InstanceStatus::BadConfig, 0, "", None)[LAST_AUTH_TIME], "");
    }

    #[test]
    fn vanished_kinds_are_blanked() {
        let mut now = MatrixVariables::new();
        now.insert("sources", vec!["A".into()]);
        let removed = removed_matrix_values(&vars(), &now);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed["destinations_count"], "");
        assert_eq!(removed["destinations_list"], "");
        assert!(removed_matrix_values(&vars(), &vars()).is_empty());
    }
}
