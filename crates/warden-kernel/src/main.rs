use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command as Cli};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use warden_kernel::audit::{AuditSink, ExecutionLogger, FsProbe, JsonlAuditLog, MemoryAuditLog};
use warden_kernel::config::GovernanceConfig;
use warden_kernel::context::GovernanceState;
use warden_kernel::executor::HandlerExecutor;
use warden_kernel::gateway::{Decision, ExecutionGateway, GatewayDecision, GatewayMode, Resolution};
use warden_kernel::orchestrator::{Orchestrator, PlanApproval, PlanCancellation};
use warden_kernel::types::{Command, Entities, PermissionMode};
use warden_kernel::workflow::Workflow;

fn cli() -> Cli {
    let config_arg = Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("Governance config (YAML)");
    let mode_arg = Arg::new("mode")
        .long("mode")
        .value_parser(["strict", "moderate", "relaxed"])
        .help("Override the permission mode");
    let audit_arg = Arg::new("audit")
        .long("audit")
        .value_parser(value_parser!(PathBuf))
        .help("Append execution records to this JSONL file");

    Cli::new("warden")
        .version(warden_kernel::VERSION)
        .about("Command risk governance and plan orchestration")
        .subcommand_required(true)
        .subcommand(
            Cli::new("evaluate")
                .about("Score, authorize and gate one command")
                .arg(Arg::new("intent").required(true).help("Intent tag, e.g. get_time"))
                .arg(
                    Arg::new("entity")
                        .long("entity")
                        .short('e')
                        .action(ArgAction::Append)
                        .help("Entity as key=value; JSON values are parsed"),
                )
                .arg(
                    Arg::new("confidence")
                        .long("confidence")
                        .default_value("1.0")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("trust")
                        .long("trust")
                        .value_parser(value_parser!(f64))
                        .help("Inject a trust score instead of the neutral default"),
                )
                .arg(
                    Arg::new("execute")
                        .long("execute")
                        .action(ArgAction::SetTrue)
                        .help("Dispatch when approved (default is dry-run)"),
                )
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .action(ArgAction::SetTrue)
                        .help("Confirm a command that requires confirmation"),
                )
                .arg(config_arg.clone())
                .arg(mode_arg.clone())
                .arg(audit_arg.clone()),
        )
        .subcommand(
            Cli::new("assess")
                .about("Compute plan-level risk for a stored workflow")
                .arg(
                    Arg::new("workflow")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(config_arg.clone())
                .arg(mode_arg.clone()),
        )
        .subcommand(
            Cli::new("run")
                .about("Run a stored workflow")
                .arg(
                    Arg::new("workflow")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("approve-plan")
                        .long("approve-plan")
                        .action(ArgAction::SetTrue)
                        .help("Approve the plan at its aggregate risk level"),
                )
                .arg(config_arg)
                .arg(mode_arg)
                .arg(audit_arg),
        )
        .subcommand(
            Cli::new("verify-audit")
                .about("Verify the hash chain of a JSONL audit log")
                .arg(Arg::new("path").required(true).value_parser(value_parser!(PathBuf))),
        )
}

fn load_state(args: &ArgMatches) -> Result<Arc<GovernanceState>> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => GovernanceConfig::load(path)?,
        None => GovernanceConfig::default(),
    };
    let state = GovernanceState::new(config);
    if let Some(mode) = args.get_one::<String>("mode") {
        state.set_permission_mode(mode.parse::<PermissionMode>()?);
    }
    Ok(Arc::new(state))
}

async fn build_gateway(args: &ArgMatches, state: Arc<GovernanceState>) -> Result<ExecutionGateway> {
    let sink: Arc<dyn AuditSink> = match args.get_one::<PathBuf>("audit") {
        Some(path) => Arc::new(JsonlAuditLog::open(path).await?),
        None => Arc::new(MemoryAuditLog::new()),
    };
    let logger = ExecutionLogger::new(Arc::new(FsProbe), sink);
    Ok(ExecutionGateway::new(
        Arc::new(HandlerExecutor::with_builtins()),
        logger,
        state,
    ))
}

fn parse_entities(args: &ArgMatches) -> Result<Entities> {
    let mut entities = Entities::new();
    for raw in args.get_many::<String>("entity").into_iter().flatten() {
        let Some((key, value)) = raw.split_once('=') else {
            bail!("entity '{raw}' is not key=value");
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::from(value));
        entities.insert(key.to_string(), value);
    }
    Ok(entities)
}

async fn load_workflow(path: &Path) -> Result<Workflow> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("invalid workflow {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn evaluate(args: &ArgMatches) -> Result<()> {
    let state = load_state(args)?;
    let gateway = build_gateway(args, state.clone()).await?;

    let intent = args.get_one::<String>("intent").context("intent is required")?;
    let confidence = *args.get_one::<f64>("confidence").unwrap_or(&1.0);
    let command = Command::new(intent.clone())
        .with_entities(parse_entities(args)?)
        .with_confidence(confidence)
        .with_raw_input(format!("cli: {intent}"));

    let mut ctx = state.snapshot();
    if let Some(trust) = args.get_one::<f64>("trust") {
        ctx = ctx.with_trust_score(*trust);
    }
    let mode = if args.get_flag("execute") {
        GatewayMode::Execute
    } else {
        GatewayMode::DryRun
    };

    let approved = match gateway.evaluate(command, &ctx, mode)? {
        GatewayDecision::Previewed(preview) => {
            println!("{}", preview.summary);
            return print_json(&preview.assessment);
        }
        GatewayDecision::AwaitingConfirmation(request) => {
            println!("{}", request.preview.summary);
            if !args.get_flag("yes") {
                println!("confirmation {} pending; re-run with --yes to approve", request.token);
                return Ok(());
            }
            match gateway.resolve(request.token, Decision::Approve)? {
                Resolution::Approved(approved) => approved,
                Resolution::Rejected(_) => bail!("confirmation rejected"),
            }
        }
        GatewayDecision::Approved(approved) => approved,
    };

    let outcome = gateway.dispatch(approved).await?;
    print_json(&outcome.record)?;
    if let Err(e) = outcome.into_result() {
        bail!(e);
    }
    Ok(())
}

async fn assess(args: &ArgMatches) -> Result<()> {
    let state = load_state(args)?;
    let path = args.get_one::<PathBuf>("workflow").context("workflow is required")?;
    let workflow = load_workflow(path).await?;
    let gateway = Arc::new(ExecutionGateway::new(
        Arc::new(HandlerExecutor::with_builtins()),
        ExecutionLogger::in_memory().0,
        state,
    ));
    print_json(&Orchestrator::new(gateway).assess(&workflow))
}

async fn run(args: &ArgMatches) -> Result<()> {
    let state = load_state(args)?;
    let path = args.get_one::<PathBuf>("workflow").context("workflow is required")?;
    let workflow = load_workflow(path).await?;
    let orchestrator = Orchestrator::new(Arc::new(build_gateway(args, state).await?));

    let approval = if args.get_flag("approve-plan") {
        PlanApproval::for_assessment(&orchestrator.assess(&workflow))
    } else {
        PlanApproval::None
    };
    let cancel = PlanCancellation::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let report = orchestrator.run(&workflow, approval, &cancel).await?;
    print_json(&report)?;
    if report.is_blocked() && report.suspended.is_none() {
        println!("plan requires approval; re-run with --approve-plan");
    }
    Ok(())
}

async fn verify_audit(args: &ArgMatches) -> Result<()> {
    let path = args.get_one::<PathBuf>("path").context("path is required")?;
    let entries = JsonlAuditLog::read_entries(path).await?;
    warden_kernel::audit::verify_chain(&entries)?;
    let irreversible = entries.iter().filter(|e| e.record.rollback.irreversible).count();
    println!(
        "{}: {} entries, chain intact, {} irreversible",
        path.display(),
        entries.len(),
        irreversible
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("evaluate", args)) => evaluate(args).await,
        Some(("assess", args)) => assess(args).await,
        Some(("run", args)) => run(args).await,
        Some(("verify-audit", args)) => verify_audit(args).await,
        _ => Ok(()),
    }
}
