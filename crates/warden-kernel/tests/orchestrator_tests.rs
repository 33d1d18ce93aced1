use std::sync::Arc;

use pretty_assertions::assert_eq;
use warden_kernel::audit::{ExecutionLogger, NullProbe};
use warden_kernel::config::{FailurePolicy, GovernanceConfig, LoopDetection, RepeatMatching};
use warden_kernel::gateway::{Decision, ExecutionGateway};
use warden_kernel::orchestrator::{
    AbortReason, Orchestrator, PlanApproval, PlanCancellation, PlanStatus, SkipReason, StepStatus,
};
use warden_kernel::policy::Principal;
use warden_kernel::workflow::{CommandTemplate, WorkflowBuilder};
use warden_kernel::{GovernanceError, PermissionMode, RiskLevel, ValidationError};
use warden_test_utils::{
    backup_workflow, orchestrator_with, repeating_workflow, state_with_config, state_with_mode,
    CappedSink, ScriptedExecutor, ScriptedPlanner,
};

#[tokio::test]
async fn test_exact_repeat_aborts_as_cyclic() {
    let state = state_with_mode(PermissionMode::Strict);
    let (orchestrator, audit, executor) = orchestrator_with(state, ScriptedExecutor::new());
    let workflow = repeating_workflow();

    let report = orchestrator
        .run(&workflow, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();

    match &report.status {
        PlanStatus::Aborted {
            reason: AbortReason::Cyclic { step, .. },
        } => assert_eq!(step.as_str(), "s3"),
        other => panic!("expected cyclic abort, got {other:?}"),
    }
    assert!(matches!(report.abort_error(), Some(GovernanceError::CyclicPlan { .. })));
    assert_eq!(report.outcomes.len(), 5);
    assert_eq!(report.completed_steps(), 2);
    assert!(matches!(report.outcome("s3").unwrap().status, StepStatus::Cyclic { .. }));
    for skipped in ["s4", "s5"] {
        assert_eq!(
            report.outcome(skipped).unwrap().status,
            StepStatus::Skipped {
                reason: SkipReason::PlanAborted
            }
        );
    }

    // Records for the steps that ran stay intact
    assert_eq!(report.records.len(), 2);
    assert_eq!(audit.len(), 2);
    assert!(audit.verify_integrity().is_ok());
    assert_eq!(executor.calls(), vec!["get_time".to_string(), "status".to_string()]);
}

#[tokio::test]
async fn test_repeat_bound_is_configurable() {
    let config = GovernanceConfig::new().with_loop_detection(LoopDetection {
        repeat_bound: 1,
        matching: RepeatMatching::Exact,
    });
    let (orchestrator, audit, _executor) = orchestrator_with(state_with_config(config), ScriptedExecutor::new());

    let report = orchestrator
        .run(&repeating_workflow(), PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(audit.len(), 5);
}

#[tokio::test]
async fn test_intent_only_matching_catches_parameter_changes() {
    let config = GovernanceConfig::new().with_loop_detection(LoopDetection {
        repeat_bound: 0,
        matching: RepeatMatching::IntentOnly,
    });
    let (orchestrator, _audit, executor) = orchestrator_with(state_with_config(config), ScriptedExecutor::new());
    let workflow = WorkflowBuilder::new("searches")
        .push("q1", CommandTemplate::new("search").with_param("query", "rust"))
        .push("q2", CommandTemplate::new("search").with_param("query", "tokio"))
        .build()
        .unwrap();

    let report = orchestrator
        .run(&workflow, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();
    assert!(matches!(
        report.status,
        PlanStatus::Aborted {
            reason: AbortReason::Cyclic { .. }
        }
    ));
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn test_failed_dependency_poisons_dependents() {
    let state = state_with_mode(PermissionMode::Strict);
    let executor = ScriptedExecutor::new().failing("get_time", "clock unavailable");
    let (orchestrator, audit, executor) = orchestrator_with(state, executor);
    let workflow = WorkflowBuilder::new("deps")
        .push("a", CommandTemplate::new("get_time"))
        .then("b", CommandTemplate::new("status"))
        .push("c", CommandTemplate::new("help"))
        .build()
        .unwrap();

    let report = orchestrator
        .run(&workflow, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::PartiallyFailed);
    assert!(matches!(report.outcome("a").unwrap().status, StepStatus::Failed { .. }));
    let b = report.outcome("b").unwrap();
    assert!(b.is_skipped());
    assert!(matches!(
        b.error(),
        Some(GovernanceError::DependencyFailed { ref dependency, .. }) if dependency == "a"
    ));
    assert_eq!(report.outcome("c").unwrap().status, StepStatus::Completed);
    assert_eq!(executor.calls(), vec!["get_time".to_string(), "help".to_string()]);
    // The failed step still has a record
    assert_eq!(audit.len(), 2);
    assert!(!audit.records()[0].success);
}

#[tokio::test]
async fn test_backup_plan_needs_and_honours_plan_approval() {
    let state = state_with_mode(PermissionMode::Strict);
    let (orchestrator, audit, executor) = orchestrator_with(state, ScriptedExecutor::new());
    let workflow = backup_workflow();

    let assessment = orchestrator.assess(&workflow);
    assert_eq!(assessment.level, RiskLevel::Medium);
    assert!(!assessment.escalated);
    assert!(assessment.requires_confirmation);

    let blocked = orchestrator
        .run(&workflow, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();
    assert!(blocked.is_blocked());
    assert!(blocked.suspended.is_none());
    assert!(blocked.outcomes.iter().all(|o| o.status
        == StepStatus::Skipped {
            reason: SkipReason::AwaitingPlanApproval
        }));
    assert_eq!(executor.call_count(), 0);

    let report = orchestrator
        .run(
            &workflow,
            PlanApproval::for_assessment(&assessment),
            &PlanCancellation::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.completed_steps(), 3);
    assert_eq!(report.steps_dispatched, 3);
    assert_eq!(report.records.len(), 3);
    assert_eq!(audit.len(), 3);
    assert_eq!(
        executor.calls(),
        vec!["create_folder".to_string(), "move_file".to_string(), "move_file".to_string()]
    );
    let intents: Vec<_> = audit.records().into_iter().map(|r| r.intent).collect();
    assert_eq!(intents, vec!["create_folder", "move_file", "move_file"]);
}

#[tokio::test]
async fn test_critical_step_suspends_even_inside_approved_plan() {
    let state = state_with_mode(PermissionMode::Relaxed);
    let (orchestrator, audit, executor) = orchestrator_with(state, ScriptedExecutor::new());
    let workflow = WorkflowBuilder::new("maintenance")
        .then("clock", CommandTemplate::new("get_time"))
        .then("reboot", CommandTemplate::new("restart_system"))
        .then("check", CommandTemplate::new("status"))
        .build()
        .unwrap();
    let approval = PlanApproval::for_assessment(&orchestrator.assess(&workflow));
    assert_eq!(approval.ceiling(), Some(RiskLevel::Critical));
    let cancel = PlanCancellation::new();

    let mut report = orchestrator.run(&workflow, approval, &cancel).await.unwrap();
    assert!(report.is_blocked());
    assert_eq!(report.outcome("clock").unwrap().status, StepStatus::Completed);
    let reboot = report.outcome("reboot").unwrap();
    assert!(matches!(reboot.status, StepStatus::AwaitingConfirmation { level: RiskLevel::Critical, .. }));
    assert!(reboot.error().is_some_and(|e| e.requires_human()));
    assert_eq!(
        report.outcome("check").unwrap().status,
        StepStatus::Skipped {
            reason: SkipReason::AwaitingConfirmation
        }
    );
    assert_eq!(executor.calls(), vec!["get_time".to_string()]);

    let suspended = report.suspended.take().expect("plan is resumable");
    assert_eq!(suspended.blocked_step().as_str(), "reboot");
    assert_eq!(suspended.state().step_counter(), 1);
    assert_eq!(orchestrator.gateway().pending(), vec![suspended.token()]);

    let resumed = orchestrator.resume(suspended, Decision::Approve, &cancel).await.unwrap();
    assert_eq!(resumed.status, PlanStatus::Completed);
    assert_eq!(resumed.records.len(), 3);
    assert_eq!(audit.len(), 3);
    assert_eq!(
        executor.calls(),
        vec!["get_time".to_string(), "restart_system".to_string(), "status".to_string()]
    );
}

#[tokio::test]
async fn test_denied_step_aborts_remainder() {
    let state = state_with_mode(PermissionMode::Relaxed);
    let (orchestrator, audit, executor) = orchestrator_with(state, ScriptedExecutor::new());
    let workflow = WorkflowBuilder::new("maintenance")
        .then("clock", CommandTemplate::new("get_time"))
        .then("off", CommandTemplate::new("shutdown_system"))
        .then("check", CommandTemplate::new("status"))
        .build()
        .unwrap();
    let approval = PlanApproval::for_assessment(&orchestrator.assess(&workflow));
    let cancel = PlanCancellation::new();

    let mut report = orchestrator.run(&workflow, approval, &cancel).await.unwrap();
    let suspended = report.suspended.take().unwrap();
    let denied = orchestrator.resume(suspended, Decision::Deny, &cancel).await.unwrap();

    assert!(matches!(
        denied.status,
        PlanStatus::Aborted {
            reason: AbortReason::ConfirmationDenied { .. }
        }
    ));
    assert!(matches!(denied.outcome("off").unwrap().status, StepStatus::Rejected { .. }));
    assert!(denied.outcome("check").unwrap().is_skipped());
    assert_eq!(denied.records.len(), 1);
    assert_eq!(audit.len(), 1);
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn test_cancellation() {
    let state = state_with_mode(PermissionMode::Relaxed);
    let (orchestrator, audit, _executor) = orchestrator_with(state, ScriptedExecutor::new());

    let cancel = PlanCancellation::new();
    cancel.cancel();
    let report = orchestrator
        .run(&repeating_workflow(), PlanApproval::None, &cancel)
        .await
        .unwrap();
    assert!(matches!(report.abort_error(), Some(GovernanceError::Cancelled)));
    assert!(report.outcomes.iter().all(|o| o.is_skipped()));
    assert!(audit.is_empty());

    // A suspended plan can be withdrawn; its token is released
    let workflow = WorkflowBuilder::new("off")
        .then("off", CommandTemplate::new("shutdown_system"))
        .build()
        .unwrap();
    let approval = PlanApproval::for_assessment(&orchestrator.assess(&workflow));
    let mut blocked = orchestrator
        .run(&workflow, approval, &PlanCancellation::new())
        .await
        .unwrap();
    let suspended = blocked.suspended.take().unwrap();
    let report = orchestrator.cancel_suspended(suspended).unwrap();
    assert!(matches!(
        report.status,
        PlanStatus::Aborted {
            reason: AbortReason::Cancelled
        }
    ));
    assert!(orchestrator.gateway().pending().is_empty());
}

#[tokio::test]
async fn test_risk_budget_stops_plan() {
    let mut config = GovernanceConfig::new().with_permission_mode(PermissionMode::Relaxed);
    config.risk_budget = 0.6;
    let (orchestrator, audit, _executor) = orchestrator_with(state_with_config(config), ScriptedExecutor::new());
    let workflow = WorkflowBuilder::new("files")
        .push("one", CommandTemplate::new("create_file").with_param("path", "one.txt"))
        .push("two", CommandTemplate::new("create_file").with_param("path", "two.txt"))
        .build()
        .unwrap();
    let approval = PlanApproval::for_assessment(&orchestrator.assess(&workflow));

    let report = orchestrator.run(&workflow, approval, &PlanCancellation::new()).await.unwrap();
    assert!(matches!(
        report.status,
        PlanStatus::Aborted {
            reason: AbortReason::RiskBudgetExhausted { .. }
        }
    ));
    assert!(matches!(report.outcome("two").unwrap().status, StepStatus::BudgetExceeded { .. }));
    assert!((report.cumulative_risk - 0.5).abs() < 1e-9);
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn test_consecutive_failures_abort() {
    let state = state_with_mode(PermissionMode::Strict);
    let executor = ScriptedExecutor::new()
        .failing("get_time", "clock unavailable")
        .failing("status", "status unavailable");
    let (orchestrator, _audit, executor) = orchestrator_with(state, executor);
    let workflow = WorkflowBuilder::new("flaky")
        .push("a", CommandTemplate::new("get_time"))
        .push("b", CommandTemplate::new("status"))
        .push("c", CommandTemplate::new("help"))
        .build()
        .unwrap();

    let report = orchestrator
        .run(&workflow, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();
    assert_eq!(
        report.status,
        PlanStatus::Aborted {
            reason: AbortReason::ConsecutiveFailures { count: 2 }
        }
    );
    assert!(report.outcome("c").unwrap().is_skipped());
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_abort_policy_stops_on_first_failure() {
    let mut config = GovernanceConfig::new();
    config.failure_policy = FailurePolicy::Abort;
    let executor = ScriptedExecutor::new().failing("get_time", "clock unavailable");
    let (orchestrator, _audit, executor) = orchestrator_with(state_with_config(config), executor);
    let workflow = WorkflowBuilder::new("strict")
        .push("a", CommandTemplate::new("get_time"))
        .push("b", CommandTemplate::new("help"))
        .build()
        .unwrap();

    let report = orchestrator
        .run(&workflow, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();
    assert!(matches!(
        report.status,
        PlanStatus::Aborted {
            reason: AbortReason::StepFailed { .. }
        }
    ));
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn test_policy_is_rechecked_per_step() {
    let state = state_with_mode(PermissionMode::Relaxed);
    state.set_principal(Principal::new("reader").grant("information"));
    let (orchestrator, audit, executor) = orchestrator_with(state, ScriptedExecutor::new());
    let workflow = WorkflowBuilder::new("mixed")
        .push("clock", CommandTemplate::new("get_time"))
        .push("write", CommandTemplate::new("create_file").with_param("path", "x.txt"))
        .push("check", CommandTemplate::new("status"))
        .build()
        .unwrap();
    let approval = PlanApproval::for_assessment(&orchestrator.assess(&workflow));

    let report = orchestrator.run(&workflow, approval, &PlanCancellation::new()).await.unwrap();
    assert_eq!(report.status, PlanStatus::PartiallyFailed);
    assert!(matches!(
        report.outcome("write").unwrap().error(),
        Some(GovernanceError::PolicyDenied { .. })
    ));
    assert_eq!(executor.calls(), vec!["get_time".to_string(), "status".to_string()]);
    assert_eq!(audit.len(), 2);
}

#[tokio::test]
async fn test_plan_length_limit() {
    let mut config = GovernanceConfig::new();
    config.max_plan_steps = 2;
    let (orchestrator, _audit, executor) = orchestrator_with(state_with_config(config), ScriptedExecutor::new());

    let result = orchestrator
        .run(&backup_workflow(), PlanApproval::None, &PlanCancellation::new())
        .await;
    assert!(matches!(
        result,
        Err(GovernanceError::Validation(ValidationError::PlanTooLong { steps: 3, limit: 2 }))
    ));
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_goal_expansion_runs_as_sequential_plan() {
    let state = state_with_mode(PermissionMode::Strict);
    let (orchestrator, audit, _executor) = orchestrator_with(state, ScriptedExecutor::new());
    let planner = ScriptedPlanner::new(vec![CommandTemplate::new("get_time"), CommandTemplate::new("status")]);

    let report = orchestrator
        .run_goal("what time is it", &planner, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.outcomes[1].step.as_str(), "step-1");
    assert_eq!(audit.len(), 2);
}

#[tokio::test]
async fn test_audit_failure_mid_plan_keeps_completed_outcomes() {
    let state = state_with_mode(PermissionMode::Strict);
    let executor = Arc::new(ScriptedExecutor::new());
    let sink = Arc::new(CappedSink::new(1));
    let logger = ExecutionLogger::new(Arc::new(NullProbe), sink.clone());
    let gateway = ExecutionGateway::new(executor.clone(), logger, state.clone());
    let orchestrator = Orchestrator::new(Arc::new(gateway));

    let workflow = WorkflowBuilder::new("status-report")
        .push("time", CommandTemplate::new("get_time"))
        .push("status", CommandTemplate::new("status"))
        .push("help", CommandTemplate::new("help"))
        .build()
        .unwrap();

    let report = orchestrator
        .run(&workflow, PlanApproval::None, &PlanCancellation::new())
        .await
        .unwrap();

    match &report.status {
        PlanStatus::Aborted {
            reason: AbortReason::Irrecoverable { step, .. },
        } => assert_eq!(step.as_str(), "status"),
        other => panic!("expected irrecoverable abort, got {other:?}"),
    }
    assert!(report.abort_error().is_some_and(|e| e.is_fatal()));
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.outcome("time").unwrap().status, StepStatus::Completed);
    assert!(matches!(report.outcome("status").unwrap().status, StepStatus::Failed { .. }));
    assert_eq!(
        report.outcome("help").unwrap().status,
        StepStatus::Skipped {
            reason: SkipReason::PlanAborted
        }
    );
    assert_eq!(report.records.len(), 1);
    assert_eq!(sink.records().len(), 1);
    assert_eq!(executor.calls(), vec!["get_time".to_string(), "status".to_string()]);
}
