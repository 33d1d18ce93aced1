use pretty_assertions::assert_eq;
use warden_kernel::workflow::{CommandTemplate, Workflow, WorkflowBuilder, WorkflowId, WorkflowStep, WorkflowStore};
use warden_kernel::{RiskLevel, StoreError, ValidationError};
use warden_test_utils::backup_workflow;

fn edges(workflow: &Workflow) -> Vec<(usize, usize)> {
    let mut edges: Vec<_> = workflow
        .dependency_graph()
        .all_edges()
        .map(|(from, to, _)| (from, to))
        .collect();
    edges.sort_unstable();
    edges
}

#[test]
fn test_json_round_trip_preserves_order_and_edges() {
    let workflow = WorkflowBuilder::new("backup")
        .tag("files")
        .push("mkdir", CommandTemplate::new("create_folder").with_param("folder", "backup"))
        .step(
            WorkflowStep::new(
                "move-a",
                1,
                CommandTemplate::new("move_file")
                    .with_param("source", "a.txt")
                    .with_param("destination", "backup/"),
            )
            .depends_on(["mkdir"]),
        )
        .step(
            WorkflowStep::new("report", 2, CommandTemplate::new("list").with_param("folder", "backup"))
                .with_description("show the result")
                .depends_on(["mkdir", "move-a"]),
        )
        .build()
        .unwrap();

    let json = serde_json::to_string_pretty(&workflow).unwrap();
    let restored: Workflow = serde_json::from_str(&json).unwrap();

    assert_eq!(restored, workflow);
    let ids: Vec<_> = restored.steps().iter().map(|s| s.id.as_str().to_string()).collect();
    assert_eq!(ids, vec!["mkdir", "move-a", "report"]);
    assert_eq!(edges(&restored), vec![(0, 1), (0, 2), (1, 2)]);
    assert_eq!(edges(&restored), edges(&workflow));
}

#[test]
fn test_reload_rejects_invalid_plans() {
    let workflow = backup_workflow();
    let mut value = serde_json::to_value(&workflow).unwrap();

    // Point the first step at a later one
    value["steps"][0]["depends_on"] = serde_json::json!(["move-b"]);
    assert!(serde_json::from_value::<Workflow>(value.clone()).is_err());

    // Break order contiguity
    value["steps"][0]["depends_on"] = serde_json::json!([]);
    value["steps"][2]["order"] = serde_json::json!(5);
    let err = serde_json::from_value::<Workflow>(value).unwrap_err();
    assert!(err.to_string().contains("contiguous"));
}

#[test]
fn test_builder_rejects_bad_dependencies() {
    let unknown = WorkflowBuilder::new("x")
        .step(WorkflowStep::new("a", 0, CommandTemplate::new("get_time")).depends_on(["ghost"]))
        .build();
    assert!(matches!(unknown, Err(ValidationError::UnknownDependency { .. })));

    let own = WorkflowBuilder::new("x")
        .step(WorkflowStep::new("a", 0, CommandTemplate::new("get_time")).depends_on(["a"]))
        .build();
    assert_eq!(own.unwrap_err(), ValidationError::SelfDependency("a".into()));

    let duplicate = WorkflowBuilder::new("x")
        .push("a", CommandTemplate::new("get_time"))
        .push("a", CommandTemplate::new("status"))
        .build();
    assert_eq!(duplicate.unwrap_err(), ValidationError::DuplicateStep("a".into()));

    let nameless = WorkflowBuilder::new("  ").push("a", CommandTemplate::new("get_time")).build();
    assert!(matches!(nameless, Err(ValidationError::Malformed(_))));
}

#[test]
fn test_revision_bumps_version() {
    let mut workflow = backup_workflow();
    let mut steps = workflow.steps().to_vec();
    steps.pop();
    workflow.revise(steps).unwrap();
    assert_eq!(workflow.version(), 2);
    assert_eq!(workflow.len(), 2);

    workflow.set_cached_risk(0.6, RiskLevel::Medium);
    assert_eq!(workflow.cached_risk().map(|c| c.level), Some(RiskLevel::Medium));
}

#[tokio::test]
async fn test_store_save_load_list_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkflowStore::open(dir.path().join("workflows")).await.unwrap();

    let mut backup = backup_workflow();
    let mut other = WorkflowBuilder::new("alpha")
        .push("clock", CommandTemplate::new("get_time"))
        .build()
        .unwrap();
    store.save(&mut backup).await.unwrap();
    store.save(&mut other).await.unwrap();

    let loaded = store.load(backup.id()).await.unwrap();
    assert_eq!(loaded, backup);
    assert_eq!(edges(&loaded), edges(&backup));

    let names: Vec<_> = store.list().await.unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["alpha", "backup"]);

    // Corrupt files are skipped when listing
    tokio::fs::write(store.root().join("broken.json"), b"{not json").await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 2);

    store.delete(other.id()).await.unwrap();
    assert!(matches!(store.load(other.id()).await, Err(StoreError::NotFound(_))));
    assert!(matches!(store.delete(other.id()).await, Err(StoreError::NotFound(_))));
    assert!(matches!(store.load(WorkflowId::new()).await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_store_revalidates_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = WorkflowStore::open(dir.path()).await.unwrap();
    let mut workflow = backup_workflow();
    store.save(&mut workflow).await.unwrap();

    let path = store.root().join(format!("{}.json", workflow.id()));
    let mut value: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    value["steps"][1]["id"] = serde_json::json!("mkdir");
    tokio::fs::write(&path, serde_json::to_vec(&value).unwrap()).await.unwrap();

    assert!(matches!(store.load(workflow.id()).await, Err(StoreError::Serde(_))));
}
