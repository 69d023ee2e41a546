use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LcmError, Result};
use crate::scheduler::configuration::Configuration;

/// What a resolved step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Run a shell command
    Shell { command: String },
    /// Do nothing (placeholder steps, tests)
    Noop,
}

/// One step of a resolved plan, produced once when the execution starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub index: u32,
    pub name: String,
    pub action: StepAction,
    /// Fact keys that must exist for every target host before the step runs
    pub requires_facts: Vec<String>,
    /// Run once per target host instead of once per execution
    pub per_host: bool,
}

/// Resolves a configuration version into the ordered steps to run.
pub trait PlaybookCatalog: Send + Sync {
    fn resolve(&self, configuration: &Configuration) -> Result<Vec<StepDescriptor>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    pub action: StepAction,
    #[serde(default)]
    pub requires_facts: Vec<String>,
    #[serde(default)]
    pub per_host: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepTemplate>,
}

/// Catalog of playbook templates with `{{ parameter }}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    playbooks: HashMap<String, PlaybookTemplate>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_playbook(mut self, playbook: PlaybookTemplate) -> Self {
        self.playbooks.insert(playbook.name.clone(), playbook);
        self
    }

    /// Parse a JSON array of playbook templates
    pub fn from_json(data: &str) -> Result<Self> {
        let templates: Vec<PlaybookTemplate> = serde_json::from_str(data)?;
        Ok(templates
            .into_iter()
            .fold(Self::new(), |catalog, t| catalog.with_playbook(t)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.playbooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl PlaybookCatalog for StaticCatalog {
    fn resolve(&self, configuration: &Configuration) -> Result<Vec<StepDescriptor>> {
        let playbook = self.playbooks.get(&configuration.playbook).ok_or_else(|| {
            LcmError::Resolution(format!("unknown playbook {}", configuration.playbook))
        })?;

        playbook
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let action = match &step.action {
                    StepAction::Shell { command } => StepAction::Shell {
                        command: substitute(command, &configuration.parameters)?,
                    },
                    StepAction::Noop => StepAction::Noop,
                };
                let requires_facts = step
                    .requires_facts
                    .iter()
                    .map(|k| substitute(k, &configuration.parameters))
                    .collect::<Result<Vec<_>>>()?;
                Ok(StepDescriptor {
                    index: i as u32,
                    name: step.name.clone(),
                    action,
                    requires_facts,
                    per_host: step.per_host,
                })
            })
            .collect()
    }
}

/// Replace every `{{ name }}` with the top-level parameter `name`.
/// Strings are inserted raw, other values as JSON.
pub fn substitute(template: &str, parameters: &serde_json::Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            LcmError::Resolution(format!("unterminated placeholder in {:?}", template))
        })?;
        let name = after[..end].trim();
        let value = parameters
            .get(name)
            .ok_or_else(|| LcmError::Resolution(format!("missing parameter {}", name)))?;
        match value {
            serde_json::Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn configuration(playbook: &str, parameters: serde_json::Value) -> Configuration {
        Configuration {
            id: Uuid::new_v4(),
            version: 1,
            name: "cfg".to_string(),
            cluster_id: "c1".to_string(),
            playbook: playbook.to_string(),
            hosts: vec!["h1".to_string()],
            parameters,
            creator: "alice".to_string(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    const CATALOG: &str = r#"[
        {
            "name": "remove_osd",
            "steps": [
                {"name": "stop", "action": {"type": "shell", "command": "systemctl stop ceph-osd@{{ osd_id }}"}, "per_host": true},
                {"name": "wipe", "action": {"type": "shell", "command": "wipe ${LCM_FACT_DEVICE}"}, "requires_facts": ["osd.{{osd_id}}"], "per_host": true},
                {"name": "report", "action": {"type": "noop"}}
            ]
        }
    ]"#;

    #[test]
    fn substitute_replaces_placeholders() {
        let params = serde_json::json!({"name": "ceph", "size": 512});
        assert_eq!(
            substitute("cluster={{ name }} size={{size}}", &params).unwrap(),
            "cluster=ceph size=512"
        );
        assert_eq!(substitute("echo ${HOME}", &params).unwrap(), "echo ${HOME}");
    }

    #[test]
    fn substitute_rejects_missing_parameter() {
        let err = substitute("{{ absent }}", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, LcmError::Resolution(_)));
        let err = substitute("{{ open", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, LcmError::Resolution(_)));
    }

    #[test]
    fn resolve_produces_indexed_steps() {
        let catalog = StaticCatalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.names(), vec!["remove_osd"]);

        let steps = catalog
            .resolve(&configuration("remove_osd", serde_json::json!({"osd_id": 3})))
            .unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].index, 0);
        assert_eq!(
            steps[0].action,
            StepAction::Shell {
                command: "systemctl stop ceph-osd@3".to_string()
            }
        );
        assert_eq!(steps[1].requires_facts, vec!["osd.3"]);
        assert_eq!(
            steps[1].action,
            StepAction::Shell {
                command: "wipe ${LCM_FACT_DEVICE}".to_string()
            }
        );
        assert_eq!(steps[2].action, StepAction::Noop);
        assert!(!steps[2].per_host);
    }

    #[test]
    fn resolve_unknown_playbook_fails() {
        let catalog = StaticCatalog::new();
        let err = catalog
            .resolve(&configuration("missing", serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, LcmError::Resolution(_)));
    }
}
