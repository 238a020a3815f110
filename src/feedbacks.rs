use std::collections::HashMap;

use crate::{
    actions::ActionCommand,
    host::{FeedbackDefinition, FeedbackKind, InstanceStatus, OptionField, OptionValues},
    matrix::{MatrixVariables, DESTINATIONS, SOURCES},
};

pub const CONNECTION_STATUS: &str = "connection_status";
pub const ROUTE_ACTIVE: &str = "route_active";

pub fn feedback_definitions(vars: &MatrixVariables) -> Vec<FeedbackDefinition> {
    let sources = vars.choices(SOURCES);
    let destinations = vars.choices(DESTINATIONS);
    vec![
        FeedbackDefinition {
            id: CONNECTION_STATUS.to_owned(),
            name: "Gateway connected".to_owned(),
            kind: FeedbackKind::Boolean,
            options: vec![],
        },
        FeedbackDefinition {
            id: ROUTE_ACTIVE.to_owned(),
            name: "Source routed to destination".to_owned(),
            kind: FeedbackKind::Boolean,
            options: vec![
                OptionField::Dropdown {
                    id: "source".to_owned(),
                    label: "Source".to_owned(),
                    default: sources.first().map(|c| c.id.clone()),
                    choices: sources,
                },
                OptionField::Dropdown {
                    id: "destination".to_owned(),
                    label: "Destination".to_owned(),
                    default: destinations.first().map(|c| c.id.clone()),
                    choices: destinations,
                },
            ],
        },
    ]
}

/// Routes this instance has set, destination -> source.
///
/// The gateway does not push route changes, so this reflects the last
/// successful actions of this instance only.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, String>,
}

impl RouteTable {
    /// Record the effect of a successful action. Returns true if routes changed.
    pub fn apply(&mut self, cmd: &ActionCommand) -> bool {
        match cmd {
            ActionCommand::Route { source, destination } => {
                self.routes.insert(destination.clone(), source.clone()).as_ref() != Some(source)
            }
            ActionCommand::ClearRoute { destination } => self.routes.remove(destination).is_some(),
            ActionCommand::RecallPreset { .. } => {
                // preset contents are not known here
                let changed = !self.routes.is_empty();
                self.routes.clear();
                changed
            }
            ActionCommand::Custom { .. } => false,
        }
    }

    pub fn source_for(&self, destination: &str) -> Option<&str> {
        self.routes.get(destination).map(|s| s.as_str())
    }

    /// Drop routes referring to values the gateway no longer offers.
    pub fn retain_known(&mut self, vars: &MatrixVariables) {
        self.routes
            .retain(|d, s| vars.contains(DESTINATIONS, d) && vars.contains(SOURCES, s));
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

/// Evaluate a boolean feedback.
pub fn evaluate(id: &str, options: &OptionValues, status: InstanceStatus, routes: &RouteTable) -> bool {
    match id {
        CONNECTION_STATUS => status == InstanceStatus::Ok,
        ROUTE_ACTIVE => match (options.get("source"), options.get("destination")) {
            (Some(src), Some(dst)) => routes.source_for(dst) == Some(src.as_str()),
            _ => false,
        },
        other => {
            log::debug!("unknown feedback {}", other);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(src: &str, dst: &str) -> OptionValues {
        [("source", src), ("destination", dst)]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn route_tracking() {
        let mut t = RouteTable::default();
        let route = ActionCommand::Route { source: "A".into(), destination: "PGM".into() };
        assert!(t.apply(&route));
        assert!(!t.apply(&route));
        assert!(evaluate(ROUTE_ACTIVE, &opts("A", "PGM"), InstanceStatus::Ok, &t));
        assert!(!evaluate(ROUTE_ACTIVE, &opts("B", "PGM"), InstanceStatus::Ok, &t));

        assert!(t.apply(&ActionCommand::Route { source: "B".into(), destination: "PGM".into() }));
        assert_eq!(t.source_for("PGM"), Some("B"));
        assert!(t.apply(&ActionCommand::ClearRoute { destination: "PGM".into() }));
        assert!(!t.apply(&ActionCommand::ClearRoute { destination: "PGM".into() }));
        assert_eq!(t.source_for("PGM"), None);
    }

    #[test]
    fn retain_known_routes() {
        let mut t = RouteTable::default();
        t.apply(&ActionCommand::Route { source: "A".into(), destination: "PGM".into() });
        t.apply(&ActionCommand::Route { source: "Z".into(), destination: "AUX".into() });
        let mut vars = MatrixVariables::new();
        vars.insert(SOURCES, vec!["A".into()]);
        vars.insert(DESTINATIONS, vec!["PGM".into(), "AUX".into()]);
        t.retain_known(&vars);
        assert_eq!(t.source_for("PGM"), Some("A"));
        assert_eq!(t.source_for("AUX"), None);
    }

    #[test]
    fn connection_feedback() {
        let t = RouteTable::default();
        let none = OptionValues::new();
        assert!(evaluate(CONNECTION_STATUS, &none, InstanceStatus::Ok, &t));
        assert!(!evaluate(CONNECTION_STATUS, &none, InstanceStatus::Connecting, &t));
        assert!(!evaluate("nope", &none, InstanceStatus::Ok, &t));
    }

    #[test]
    fn definitions() {
        let mut vars = MatrixVariables::new();
        vars.insert(SOURCES, vec!["A".into()]);
        let defs = feedback_definitions(&vars);
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[1].options[0].id(), "source");
    }
}
