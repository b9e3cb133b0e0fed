//! Stacks, playbooks and custom actions, as declared by the devops image.
//!
//! ```yaml
//! web:
//!   playbooks:
//!     frontend:
//!       location: playbooks/web/frontend.yml
//!       about: Deploy the public website.
//!       actions:
//!         rollback:
//!           about: Roll back to the previous release.
//!           vars:
//!             release: previous
//! ```

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Verbs that mean "run the playbook as declared".
pub const DEFAULT_VERBS: [&str; 2] = ["run", "deploy"];
pub const RESTART_VERB: &str = "restart";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Action {
    #[serde(default)]
    pub about: String,
    #[serde(default, deserialize_with = "scalar_map")]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Playbook {
    pub location: String,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub actions: BTreeMap<String, Action>,
}

impl Playbook {
    pub fn action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Stack {
    #[serde(default)]
    pub playbooks: BTreeMap<String, Playbook>,
}

impl Stack {
    pub fn playbook_names(&self) -> Vec<String> {
        self.playbooks.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    pub stacks: BTreeMap<String, Stack>,
}

impl Catalog {
    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        // An empty file is a valid, empty catalog.
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_yaml::from_slice(raw).context("invalid catalog YAML")
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.get(name)
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.stacks.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }
}

/// The variant of a playbook run a command asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum RunAction {
    /// Plain `run`/`deploy`.
    Default,
    /// Built-in restart: only tasks tagged `restart`.
    Restart,
    /// A declared action and its extra variables.
    Custom { name: String, action: Action },
}

impl RunAction {
    pub fn name(&self) -> &str {
        match self {
            Self::Default => DEFAULT_VERBS[0],
            Self::Restart => RESTART_VERB,
            Self::Custom { name, .. } => name,
        }
    }

    /// `ansible-playbook` argv for `playbook`.
    pub fn ansible_args(&self, playbook: &Playbook) -> Vec<String> {
        let mut args = vec!["ansible-playbook".to_string()];
        match self {
            Self::Default => {}
            Self::Restart => args.extend(["--tags".to_string(), "restart".to_string()]),
            Self::Custom { action, .. } => {
                for (k, v) in &action.vars {
                    args.push("--extra-vars".to_string());
                    args.push(format!("{k}={v}"));
                }
            }
        }
        args.push(playbook.location.clone());
        args
    }
}

/// The verb a user typed, before it is checked against a playbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionVerb {
    Default,
    Restart,
    Custom(String),
}

impl ActionVerb {
    pub fn from_verb(verb: &str) -> Self {
        if DEFAULT_VERBS.contains(&verb) {
            Self::Default
        } else if verb == RESTART_VERB {
            Self::Restart
        } else {
            Self::Custom(verb.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Default => DEFAULT_VERBS[0],
            Self::Restart => RESTART_VERB,
            Self::Custom(name) => name,
        }
    }

    /// Match the verb against `playbook`. A declared `restart` action
    /// overrides the built-in one. `None` for an undeclared custom action.
    pub fn resolve(&self, playbook: &Playbook) -> Option<RunAction> {
        match self {
            Self::Default => Some(RunAction::Default),
            Self::Restart => Some(match playbook.actions.get(RESTART_VERB) {
                Some(action) => RunAction::Custom {
                    name: RESTART_VERB.to_string(),
                    action: action.clone(),
                },
                None => RunAction::Restart,
            }),
            Self::Custom(name) => playbook.actions.get(name).map(|action| RunAction::Custom {
                name: name.clone(),
                action: action.clone(),
            }),
        }
    }
}

/// Accept numbers and booleans as variable values, rendering them as text.
fn scalar_map<'de, D>(de: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_yaml::Value>> = Option::deserialize(de)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Null => String::new(),
                other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_string(),
            };
            (k, v)
        })
        .collect())
}
