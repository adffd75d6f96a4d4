//! autopatch - guarded, checkpointed execution of model-proposed patches.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use autopatch::audit::AuditLogger;
use autopatch::checkpoint::{CheckpointManager, CheckpointStatus, OutcomeStatus, TransactionOutcome};
use autopatch::circuit::{CircuitBreaker, CircuitState};
use autopatch::config::{validate, AutopatchConfig, ConfigLoader};
use autopatch::guard::{GuardMode, Severity, ShadowModeGuard};
use autopatch::r#loop::operations::{CommandBackend, CommandVerifier};
use autopatch::r#loop::{LoopEnv, LoopSummary, StateMachine};
use autopatch::AutopatchError;

/// Session id recorded for operator commands.
const CLI_SESSION: &str = "cli";

#[derive(Parser)]
#[command(name = "autopatch")]
#[command(version)]
#[command(about = "Apply model-proposed patches under a policy guard, inside git checkpoints", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short = 'C', long, global = true, env = "AUTOPATCH_PROJECT", default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "AUTOPATCH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one task through the loop
    Run {
        /// What the model should accomplish
        task: String,

        /// Backend command (overrides [backend].command)
        #[arg(long, env = "AUTOPATCH_BACKEND")]
        backend: Option<String>,

        /// Recovery retries before giving up
        #[arg(long)]
        max_retries: Option<u32>,

        /// Hard ceiling on loop iterations
        #[arg(long)]
        max_loops: Option<u32>,

        /// Task wall-clock budget in seconds
        #[arg(long, env = "AUTOPATCH_TIMEOUT")]
        timeout: Option<u64>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect and decide on withheld operations
    Guard {
        #[command(subcommand)]
        action: GuardAction,
    },

    /// Manage the checkpoint transaction
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Inspect or reset the backend circuit breaker
    Circuit {
        #[command(subcommand)]
        action: CircuitAction,
    },

    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum GuardAction {
    /// Show the mode, or set it (disabled, enabled, strict)
    Mode {
        value: Option<GuardMode>,
    },

    /// List operations awaiting a decision
    Pending {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Approve a withheld operation
    Approve {
        id: String,

        #[arg(long)]
        note: Option<String>,
    },

    /// Reject a withheld operation
    Reject {
        id: String,

        #[arg(long)]
        note: Option<String>,
    },

    /// Drop every queued operation
    Clear,

    /// List trust rules
    Trusted,

    /// Remove a trust rule
    Revoke {
        fingerprint: String,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Open a transaction over the current working tree
    Start {
        #[arg(short, long, default_value = "manual checkpoint")]
        message: String,
    },

    /// Keep the changes and close the transaction
    Commit,

    /// Restore the working tree and close the transaction
    Rollback,

    /// Show the open transaction
    Status,
}

#[derive(Subcommand)]
enum CircuitAction {
    /// Show breaker state and call budget
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Close the breaker
    Reset {
        /// Also reset this hour's call count
        #[arg(long)]
        budget: bool,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Check the hash chain
    Verify,

    /// Show the most recent entries
    Tail {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,

    /// Check field ranges
    Validate,

    /// Show which config files were loaded
    Paths,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let project = match cli.project.canonicalize() {
        Ok(path) => path,
        Err(_) => {
            eprintln!(
                "{} Project directory does not exist: {}",
                "Error:".red().bold(),
                cli.project.display()
            );
            return ExitCode::from(1);
        }
    };

    match dispatch(cli.command, &project).await {
        Ok(code) => exit_code(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            let code = e
                .downcast_ref::<AutopatchError>()
                .map_or(1, AutopatchError::exit_code);
            exit_code(code)
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_env("AUTOPATCH_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "autopatch=debug,info" } else { "warn" })
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn dispatch(command: Commands, project: &Path) -> anyhow::Result<i32> {
    let config = AutopatchConfig::load(project)?;
    match command {
        Commands::Run {
            task,
            backend,
            max_retries,
            max_loops,
            timeout,
            json,
        } => {
            let mut config = config;
            if let Some(command) = backend {
                config.backend.command = Some(command);
            }
            if let Some(n) = max_retries {
                config.loop_config.max_retries = n;
            }
            if let Some(n) = max_loops {
                config.loop_config.max_loops = n;
            }
            if let Some(secs) = timeout {
                config.loop_config.task_timeout_secs = secs;
            }
            run_task(project, &config, &task, json).await
        }
        Commands::Guard { action } => guard_command(project, &config, action),
        Commands::Checkpoint { action } => checkpoint_command(project, action),
        Commands::Circuit { action } => circuit_command(project, &config, action),
        Commands::Audit { action } => audit_command(project, action),
        Commands::Config { action } => config_command(project, &config, action),
    }
}

// ============================================================================
// run
// ============================================================================

async fn run_task(
    project: &Path,
    config: &AutopatchConfig,
    task: &str,
    json: bool,
) -> anyhow::Result<i32> {
    let report = validate(config);
    if !report.is_valid() {
        print_report(&report.errors, &report.warnings);
        return Err(AutopatchError::config(report.summary()).into());
    }

    let backend = CommandBackend::from_config(&config.backend, project)
        .map_err(|e| AutopatchError::config(format!("{e:#}")))?;
    let verifier = CommandVerifier::new(project, config.verifier.clone());
    let audit = Arc::new(AuditLogger::new(project.to_path_buf())?);
    let session_id = uuid::Uuid::new_v4().to_string();
    let guard =
        ShadowModeGuard::open(project, &config.guard)?.with_audit(audit.clone(), &session_id);

    let env = LoopEnv::new(
        project,
        config,
        Arc::new(backend),
        Arc::new(verifier),
        Arc::new(guard),
    )
    .with_session_id(&session_id)
    .with_audit(audit);

    let mut machine = StateMachine::new(env);
    let cancel = machine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    let summary = machine.run(task).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(summary.exit_code())
}

fn print_summary(summary: &LoopSummary) {
    let label = if summary.succeeded() {
        "OK".green().bold()
    } else {
        "Stopped:".red().bold()
    };
    println!("{} {}", label, summary.exit_reason);
    println!(
        "   {} loop(s), {} retr(ies), {:.1}s",
        summary.loops,
        summary.retries,
        summary.elapsed_ms as f64 / 1000.0
    );
    if !summary.files_changed.is_empty() {
        println!("\n{} Files changed:", "Changes:".cyan().bold());
        for file in &summary.files_changed {
            println!("   → {file}");
        }
    }
    if !summary.status_reports.is_empty() {
        println!("\n{}", "Status:".cyan().bold());
        for report in &summary.status_reports {
            println!("   {report}");
        }
    }
    if !summary.succeeded() && !summary.last_errors.is_empty() {
        println!("\n{}", "Last errors:".yellow().bold());
        for error in &summary.last_errors {
            println!("   {error}");
        }
    }
}

// ============================================================================
// guard
// ============================================================================

fn guard_command(
    project: &Path,
    config: &AutopatchConfig,
    action: GuardAction,
) -> anyhow::Result<i32> {
    let audit = Arc::new(AuditLogger::new(project.to_path_buf())?);
    let guard = ShadowModeGuard::open(project, &config.guard)?.with_audit(audit, CLI_SESSION);

    match action {
        GuardAction::Mode { value: None } => {
            println!("{}", guard.mode().to_string().bold());
        }
        GuardAction::Mode { value: Some(mode) } => {
            guard.set_mode(mode)?;
            println!("{} Guard mode set to {}", "OK".green().bold(), mode);
        }
        GuardAction::Pending { json } => {
            let pending = guard.pending()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("{} Nothing awaiting approval", "OK".green());
            } else {
                for op in &pending {
                    let state = match op.approved {
                        Some(true) => " (approved)".green().to_string(),
                        Some(false) => " (rejected)".red().to_string(),
                        None => String::new(),
                    };
                    println!(
                        "{} {} {} {}{}",
                        op.id.bold(),
                        severity_label(op.severity),
                        op.operation_type,
                        op.description,
                        state
                    );
                    if !op.redacted_preview.is_empty() {
                        for line in op.redacted_preview.lines().take(5) {
                            println!("      {}", line.dimmed());
                        }
                    }
                }
            }
        }
        GuardAction::Approve { id, note } => {
            if !guard.approve_operation(&id, note.as_deref())? {
                eprintln!("{} No pending operation {}", "Error:".red().bold(), id);
                return Ok(1);
            }
            println!("{} Approved {}", "OK".green().bold(), id);
        }
        GuardAction::Reject { id, note } => {
            if !guard.reject_operation(&id, note.as_deref())? {
                eprintln!("{} No pending operation {}", "Error:".red().bold(), id);
                return Ok(1);
            }
            println!("{} Rejected {}", "OK".green().bold(), id);
        }
        GuardAction::Clear => {
            let removed = guard.clear_pending()?;
            println!("{} Cleared {} operation(s)", "OK".green().bold(), removed);
        }
        GuardAction::Trusted => {
            let rules = guard.trust_rules()?;
            if rules.is_empty() {
                println!("No trust rules");
            }
            for rule in rules {
                println!(
                    "{} {} {}",
                    rule.fingerprint.bold(),
                    rule.operation_type,
                    rule.description
                );
            }
        }
        GuardAction::Revoke { fingerprint } => {
            if !guard.revoke_trust(&fingerprint)? {
                eprintln!("{} No trust rule {}", "Error:".red().bold(), fingerprint);
                return Ok(1);
            }
            println!("{} Revoked {}", "OK".green().bold(), fingerprint);
        }
    }
    Ok(0)
}

fn severity_label(severity: Severity) -> colored::ColoredString {
    let text = format!("[{severity}]");
    match severity {
        Severity::Low => text.green(),
        Severity::Medium => text.yellow(),
        Severity::High => text.red(),
        Severity::Critical => text.red().bold(),
    }
}

// ============================================================================
// checkpoint
// ============================================================================

fn checkpoint_command(project: &Path, action: CheckpointAction) -> anyhow::Result<i32> {
    let audit = Arc::new(AuditLogger::new(project.to_path_buf())?);
    let manager = CheckpointManager::new(project).with_audit(audit, CLI_SESSION);

    let outcome = match action {
        CheckpointAction::Start { message } => manager.start(&message),
        CheckpointAction::Commit => manager.commit(),
        CheckpointAction::Rollback => manager.rollback(),
        CheckpointAction::Status => {
            match manager.status() {
                CheckpointStatus::Idle => println!("No active transaction"),
                CheckpointStatus::Active {
                    record,
                    current_changes,
                } => {
                    println!(
                        "{} {}",
                        "Transaction:".cyan().bold(),
                        record.transaction_id
                    );
                    println!("   Kind:        {}", record.kind);
                    println!("   Reference:   {}", record.short_reference());
                    println!("   Opened:      {}", record.created_at.to_rfc3339());
                    println!("   Description: {}", record.description);
                    println!("   Changes:     {}", current_changes.len());
                    for change in current_changes {
                        println!("      {change}");
                    }
                }
            }
            return Ok(0);
        }
    };
    Ok(print_outcome(&outcome))
}

fn print_outcome(outcome: &TransactionOutcome) -> i32 {
    match outcome.status {
        OutcomeStatus::Ok => {
            println!("{} {}", "OK".green().bold(), outcome.message);
            if let Some(id) = &outcome.transaction_id {
                println!("   Transaction: {id}");
            }
            0
        }
        OutcomeStatus::Partial => {
            eprintln!("{} {}", "Partial:".yellow().bold(), outcome.message);
            4
        }
        OutcomeStatus::Error => {
            eprintln!("{} {}", "Error:".red().bold(), outcome.message);
            4
        }
    }
}

// ============================================================================
// circuit
// ============================================================================

fn circuit_command(
    project: &Path,
    config: &AutopatchConfig,
    action: CircuitAction,
) -> anyhow::Result<i32> {
    let audit = Arc::new(AuditLogger::new(project.to_path_buf())?);
    let mut breaker =
        CircuitBreaker::load(project, config.circuit.clone()).with_audit(audit, CLI_SESSION);

    match action {
        CircuitAction::Status { json } => {
            let status = breaker.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(0);
            }
            let state = match status.state {
                CircuitState::Closed => status.state.to_string().green(),
                CircuitState::HalfOpen => status.state.to_string().yellow(),
                CircuitState::Open => status.state.to_string().red().bold(),
            };
            println!("{} {}", "Circuit:".cyan().bold(), state);
            println!(
                "   Failures:    {}/{}",
                status.consecutive_failures, status.failure_threshold
            );
            println!(
                "   Calls:       {}/{} this hour",
                status.calls_this_hour, status.hourly_quota
            );
            if let Some(secs) = status.cooldown_remaining_secs {
                println!("   Retry in:    {secs}s");
            }
            if let Some(error) = &status.last_error {
                println!("   Last error:  {error}");
            }
        }
        CircuitAction::Reset { budget } => {
            breaker.reset()?;
            if budget {
                breaker.reset_budget()?;
            }
            println!("{} Circuit closed", "OK".green().bold());
        }
    }
    Ok(0)
}

// ============================================================================
// audit
// ============================================================================

fn audit_command(project: &Path, action: AuditAction) -> anyhow::Result<i32> {
    let audit = AuditLogger::new(project.to_path_buf())?;
    match action {
        AuditAction::Verify => {
            let report = audit.verify()?;
            match report.broken {
                None => {
                    println!("{} {} entries verified", "OK".green().bold(), report.verified);
                    Ok(0)
                }
                Some(broken) => {
                    eprintln!(
                        "{} Chain broken at entry {}: {}",
                        "Error:".red().bold(),
                        broken.index,
                        broken.reason
                    );
                    Ok(1)
                }
            }
        }
        AuditAction::Tail { limit } => {
            for entry in audit.tail(limit)? {
                println!(
                    "{} {} {} {} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.event_type.to_string().bold(),
                    entry.session_id,
                    entry.actor,
                    entry.data
                );
            }
            Ok(0)
        }
    }
}

// ============================================================================
// config
// ============================================================================

fn config_command(
    project: &Path,
    config: &AutopatchConfig,
    action: ConfigAction,
) -> anyhow::Result<i32> {
    match action {
        ConfigAction::Show => {
            let text = toml::to_string_pretty(config).context("Failed to render config")?;
            println!("{text}");
            Ok(0)
        }
        ConfigAction::Validate => {
            let report = validate(config);
            print_report(&report.errors, &report.warnings);
            if report.is_valid() {
                println!("{} {}", "OK".green().bold(), report.summary());
            } else {
                eprintln!("{} {}", "Error:".red().bold(), report.summary());
            }
            Ok(report.exit_code())
        }
        ConfigAction::Paths => {
            let (_, chain) = ConfigLoader::new().load_with_chain(project)?;
            println!("{}", chain.describe());
            Ok(0)
        }
    }
}

fn print_report(errors: &[String], warnings: &[String]) {
    for error in errors {
        eprintln!("   {} {}", "✗".red(), error);
    }
    for warning in warnings {
        eprintln!("   {} {}", "Warning:".yellow(), warning);
    }
}
