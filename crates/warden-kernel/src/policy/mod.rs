//! Capability policy.
//!
//! Rules are plain data (capability → intents, a deny list, default grants)
//! and the check is binary: numeric risk plays no part here. Anything not
//! explicitly owned by a capability is denied.

use crate::error::ConfigError;
use crate::types::Command;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub intents: Vec<String>,
}

impl CapabilityRule {
    pub fn new(name: impl Into<String>, intents: &[&str]) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            intents: intents.iter().map(|i| (*i).to_string()).collect(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    pub capabilities: Vec<CapabilityRule>,
    /// Intents refused regardless of capability
    pub deny: BTreeSet<String>,
    /// Capabilities granted to a principal that declares none
    pub default_grants: BTreeSet<String>,
}

impl Default for PolicyRules {
    fn default() -> Self {
        let capabilities = vec![
            CapabilityRule::new(
                "information",
                &["get_time", "get_weather", "help", "status", "list", "search"],
            )
            .with_description("read-only queries"),
            CapabilityRule::new(
                "files",
                &[
                    "read_file",
                    "create_file",
                    "create_folder",
                    "move_file",
                    "rename_file",
                    "copy_file",
                    "write_file",
                    "modify_file",
                    "delete_file",
                    "delete_folder",
                ],
            )
            .with_description("user file management"),
            CapabilityRule::new(
                "applications",
                &[
                    "open_application",
                    "close_application",
                    "install_application",
                    "uninstall",
                ],
            )
            .with_description("application lifecycle"),
            CapabilityRule::new(
                "system",
                &["shutdown_system", "restart_system", "run_script", "modify_registry"],
            )
            .with_description("host-level control"),
        ];
        let default_grants = capabilities.iter().map(|c| c.name.clone()).collect();
        Self {
            capabilities,
            deny: ["format_drive", "delete_system_file"]
                .into_iter()
                .map(String::from)
                .collect(),
            default_grants,
        }
    }
}

impl PolicyRules {
    pub fn validate(&self) -> Result<(), ConfigError> {
        CapabilityRegistry::from_rules(self).map(|_| ())
    }
}

/// Acting identity and the capabilities it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub capabilities: BTreeSet<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_default_grants(name: impl Into<String>, rules: &PolicyRules) -> Self {
        Self {
            name: name.into(),
            capabilities: rules.default_grants.clone(),
        }
    }

    #[must_use]
    pub fn grant(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    #[must_use]
    pub fn revoke(mut self, capability: &str) -> Self {
        self.capabilities.remove(capability);
        self
    }

    pub fn holds(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    DenyListed,
    Unowned,
    NotGranted { capability: String },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::DenyListed => f.write_str("intent is on the deny list"),
            DenyReason::Unowned => f.write_str("no capability governs this intent"),
            DenyReason::NotGranted { capability } => {
                write!(f, "principal lacks capability '{capability}'")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow { capability: String },
    Deny { reason: DenyReason },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow { .. })
    }
}

/// Intent → owning capability index built from [`PolicyRules`].
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    owners: BTreeMap<String, String>,
    deny: BTreeSet<String>,
}

impl CapabilityRegistry {
    /// Each intent may be owned by exactly one capability.
    pub fn from_rules(rules: &PolicyRules) -> Result<Self, ConfigError> {
        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        for rule in &rules.capabilities {
            for intent in &rule.intents {
                match owners.get(intent) {
                    Some(existing) if existing != &rule.name => {
                        return Err(ConfigError::DuplicateIntentOwner {
                            intent: intent.clone(),
                            existing: existing.clone(),
                        });
                    }
                    _ => {
                        owners.insert(intent.clone(), rule.name.clone());
                    }
                }
            }
        }
        Ok(Self {
            owners,
            deny: rules.deny.clone(),
        })
    }

    pub fn owner_of(&self, intent: &str) -> Option<&str> {
        self.owners.get(intent).map(String::as_str)
    }

    /// Deny list first, then ownership, then the principal's grants.
    pub fn authorize(&self, command: &Command, principal: &Principal) -> PolicyDecision {
        let intent = command.intent.as_str();
        if self.deny.contains(intent) {
            return PolicyDecision::Deny {
                reason: DenyReason::DenyListed,
            };
        }
        let Some(capability) = self.owner_of(intent) else {
            return PolicyDecision::Deny {
                reason: DenyReason::Unowned,
            };
        };
        if principal.holds(capability) {
            PolicyDecision::Allow {
                capability: capability.to_string(),
            }
        } else {
            PolicyDecision::Deny {
                reason: DenyReason::NotGranted {
                    capability: capability.to_string(),
                },
            }
        }
    }
}
