use super::ResourceState;
use crate::executor::ResourceChange;
use crate::types::Entities;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Intents that never change state.
pub const READ_ONLY_INTENTS: &[&str] = &[
    "get_time",
    "get_weather",
    "help",
    "status",
    "list",
    "search",
    "read_file",
];

/// One compensating action, replayed through the gateway like any command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackInstruction {
    pub intent: String,
    pub entities: Entities,
    pub description: String,
}

impl RollbackInstruction {
    fn new(intent: &str, description: String) -> Self {
        Self {
            intent: intent.to_string(),
            entities: Entities::new(),
            description,
        }
    }

    fn with(mut self, key: &str, value: &str) -> Self {
        self.entities.insert(key.to_string(), Value::from(value));
        self
    }

    fn delete(path: &str, folder: bool) -> Self {
        let intent = if folder { "delete_folder" } else { "delete_file" };
        Self::new(intent, format!("remove created '{path}'")).with("path", path)
    }

    fn move_back(from: &str, to: &str) -> Self {
        Self::new("move_file", format!("move '{from}' back to '{to}'"))
            .with("source", from)
            .with("destination", to)
    }
}

/// Ordered compensating actions. An empty list with `irreversible = false`
/// means there is genuinely nothing to undo; `note` says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollback {
    pub instructions: Vec<RollbackInstruction>,
    pub irreversible: bool,
    pub note: Option<String>,
}

impl Rollback {
    fn nothing(note: &str) -> Self {
        Self {
            instructions: Vec::new(),
            irreversible: false,
            note: Some(note.to_string()),
        }
    }

    fn irreversible(note: String) -> Self {
        Self {
            instructions: Vec::new(),
            irreversible: true,
            note: Some(note),
        }
    }

    fn reversible(instructions: Vec<RollbackInstruction>) -> Self {
        Self {
            instructions,
            irreversible: false,
            note: None,
        }
    }
}

/// Derives rollback instructions for one dispatch.
///
/// Changes reported by the executor take precedence. Without them a
/// successful step falls back to intent-specific inverse rules, then to the
/// delta between the `before` and `after` resource maps. A failed or
/// timed-out step may still be acting downstream, so it is irreversible
/// unless every target was observed unchanged.
pub fn synthesize_rollback(
    intent: &str,
    entities: &Entities,
    before: &BTreeMap<String, ResourceState>,
    after: &BTreeMap<String, ResourceState>,
    changes: &[ResourceChange],
    success: bool,
) -> Rollback {
    if READ_ONLY_INTENTS.contains(&intent) {
        return Rollback::nothing("no side effects");
    }
    if !changes.is_empty() {
        return from_changes(intent, changes);
    }

    let observed = observe(before, after);
    if success {
        return match from_entities(intent, entities) {
            Some(rollback) => rollback,
            None => from_observed(intent, &observed, format!("no inverse known for '{intent}'")),
        };
    }
    if observed.blind {
        return Rollback::irreversible(format!("'{intent}' failed and its effects could not be observed"));
    }
    match observed.changes.first() {
        None => Rollback::nothing("step failed before changing state"),
        Some(change) => Rollback::irreversible(format!(
            "'{intent}' failed after changing {}",
            change.resources().join(", ")
        )),
    }
}

/// Resource changes visible in the snapshots, plus whether any resource
/// could not be observed on either side.
struct Observed {
    changes: Vec<ResourceChange>,
    blind: bool,
}

fn observe(before: &BTreeMap<String, ResourceState>, after: &BTreeMap<String, ResourceState>) -> Observed {
    let mut changes = Vec::new();
    let mut blind = after.is_empty();
    for (resource, now) in after {
        match (before.get(resource), now) {
            (None | Some(ResourceState::Unknown), _) | (_, ResourceState::Unknown) => blind = true,
            (Some(ResourceState::Absent), ResourceState::Present { .. }) => {
                changes.push(ResourceChange::Created {
                    resource: resource.clone(),
                });
            }
            (Some(ResourceState::Present { .. }), ResourceState::Absent) => {
                changes.push(ResourceChange::Removed {
                    resource: resource.clone(),
                });
            }
            (Some(ResourceState::Present { fingerprint: a }), ResourceState::Present { fingerprint: b }) if a != b => {
                changes.push(ResourceChange::Modified {
                    resource: resource.clone(),
                });
            }
            _ => {}
        }
    }
    Observed { changes, blind }
}

/// Observed creations are undone by deleting them; anything else observed
/// changed, or anything unobservable, makes the record irreversible.
fn from_observed(intent: &str, observed: &Observed, blind_note: String) -> Rollback {
    if observed.blind {
        return Rollback::irreversible(blind_note);
    }
    if observed.changes.is_empty() {
        return Rollback::nothing("no resource changed");
    }
    from_changes(intent, &observed.changes)
}

fn from_changes(intent: &str, changes: &[ResourceChange]) -> Rollback {
    let folder = intent == "create_folder";
    let mut instructions = Vec::with_capacity(changes.len());
    // Undo in reverse order of application.
    for change in changes.iter().rev() {
        match change {
            ResourceChange::Created { resource } => {
                instructions.push(RollbackInstruction::delete(resource, folder));
            }
            ResourceChange::Moved { from, to } => {
                instructions.push(RollbackInstruction::move_back(to, from));
            }
            ResourceChange::Removed { resource } => {
                return Rollback::irreversible(format!("'{resource}' was removed and cannot be restored"));
            }
            ResourceChange::Modified { resource } => {
                return Rollback::irreversible(format!(
                    "'{resource}' was modified and no backup was captured"
                ));
            }
        }
    }
    Rollback::reversible(instructions)
}

fn entity<'a>(entities: &'a Entities, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| entities.get(*k).and_then(Value::as_str))
}

fn from_entities(intent: &str, entities: &Entities) -> Option<Rollback> {
    let target = entity(entities, &["path", "filename", "file", "folder", "target"]);
    let source = entity(entities, &["source", "path", "filename", "file"]);
    let destination = entity(entities, &["destination", "target"]);

    let instruction = match (intent, target, source, destination) {
        ("create_file", Some(path), _, _) => Some(RollbackInstruction::delete(path, false)),
        ("create_folder", Some(path), _, _) => Some(RollbackInstruction::delete(path, true)),
        ("copy_file", _, _, Some(dest)) => Some(RollbackInstruction::delete(dest, false)),
        ("move_file" | "rename_file", _, Some(src), Some(dest)) => {
            Some(RollbackInstruction::move_back(&landed_at(src, dest), src))
        }
        _ => None,
    };
    instruction.map(|i| Rollback::reversible(vec![i]))
}

/// Where a moved file ends up when the destination names a directory.
fn landed_at(source: &str, destination: &str) -> String {
    if destination.ends_with('/') || destination.ends_with('\\') {
        let name = source.rsplit(['/', '\\']).next().unwrap_or(source);
        format!("{destination}{name}")
    } else {
        destination.to_string()
    }
}
