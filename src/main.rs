use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use overseer::config::ExecutorConfig;
use overseer::events::EventFilter;
use overseer::executor::Executor;
use overseer::issue::{Dependency, Issue, IssueFilter, IssueType, IssueUpdate, Status};
use overseer::oracle::{CommandSupervisor, Supervisor};
use overseer::shutdown::install_shutdown_handler;
use overseer::store::Store;

#[derive(Parser, Debug)]
#[command(name = "overseer")]
#[command(about = "AI-agent execution supervisor over a shared issue tracker")]
struct Cli {
    /// Database path
    #[arg(long, default_value = ".overseer/overseer.db", global = true)]
    db: PathBuf,

    /// Actor name for the audit trail (default: $USER)
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the database
    Init,
    /// Run the executor event loops until interrupted
    Run(RunArgs),
    /// Create a new issue
    Create {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        design: String,
        #[arg(long, default_value = "")]
        acceptance: String,
        /// Priority (0-4, 0 = highest)
        #[arg(short, long, default_value = "2")]
        priority: i32,
        #[arg(short = 't', long, default_value = "task")]
        issue_type: String,
        #[arg(short, long)]
        labels: Vec<String>,
    },
    /// Show issue details
    Show { id: String },
    /// List issues
    List {
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long)]
        assignee: Option<String>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Update an issue
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        assignee: Option<String>,
    },
    /// Close one or more issues
    Close {
        ids: Vec<String>,
        #[arg(short, long, default_value = "Closed")]
        reason: String,
    },
    /// Add a dependency: ISSUE depends on BLOCKER
    Dep { issue: String, blocker: String },
    /// Show recent agent events
    Events {
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        issue: Option<String>,
    },
    /// Show issue statistics
    Stats,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Work-loop tick in seconds (also the heartbeat cadence)
    #[arg(long, default_value = "5")]
    poll_interval: u64,

    /// Disable AI supervision (assessment, watchdog analysis, dedup)
    #[arg(long)]
    no_ai: bool,

    /// Disable quality gate enforcement
    #[arg(long)]
    no_gates: bool,

    /// Disable per-mission sandboxes
    #[arg(long)]
    no_sandboxes: bool,

    /// Keep failed sandboxes on disk for debugging
    #[arg(long)]
    keep_sandbox_on_failure: bool,

    /// Keep mission branches after cleanup
    #[arg(long)]
    keep_branches: bool,

    /// Root directory for sandbox worktrees
    #[arg(long, default_value = ".sandboxes")]
    sandbox_root: PathBuf,

    /// Parent git repository for sandboxes
    #[arg(long, default_value = ".")]
    parent_repo: PathBuf,

    /// Base branch for mission worktrees
    #[arg(long, default_value = "main")]
    default_branch: String,

    /// Coding-agent program (receives the prompt on stdin)
    #[arg(long, default_value = "amp")]
    agent: String,

    /// Per-agent timeout in seconds
    #[arg(long, default_value = "1800")]
    agent_timeout: u64,

    /// Oracle command for AI judgments (JSON on stdin/stdout)
    #[arg(long)]
    oracle: Option<String>,

    /// Grace period for shutdown in seconds
    #[arg(long, default_value = "30")]
    stop_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let actor = cli
        .actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string());

    let store = Arc::new(Store::open(&cli.db)?);

    match cli.command {
        Command::Init => {
            println!("Initialized database at {}", store.path().display());
        }
        Command::Run(args) => run_executor(store, args).await?,
        Command::Create {
            title,
            description,
            design,
            acceptance,
            priority,
            issue_type,
            labels,
        } => {
            let mut issue = Issue::new(title);
            issue.description = description;
            issue.design = design;
            issue.acceptance_criteria = acceptance;
            issue.priority = priority.clamp(0, 4);
            issue.issue_type = IssueType::parse(&issue_type).unwrap_or_default();
            store.create_issue(&mut issue, &actor)?;
            for label in labels {
                store.add_label(&issue.id, &label)?;
            }
            println!("Created issue {}", issue.id);
            println!("  Title: {}", issue.title);
            println!("  Priority: P{}", issue.priority);
        }
        Command::Show { id } => {
            let issue = store.get_issue(&id)?;
            println!("\n{}: {}", issue.id, issue.title);
            println!("Status: {}", issue.status);
            println!("Priority: P{}", issue.priority);
            println!("Type: {}", issue.issue_type);
            if let Some(assignee) = &issue.assignee {
                println!("Assignee: {assignee}");
            }
            if !issue.description.is_empty() {
                println!("\nDescription:\n{}", issue.description);
            }
            if !issue.design.is_empty() {
                println!("\nDesign:\n{}", issue.design);
            }
            if !issue.acceptance_criteria.is_empty() {
                println!("\nAcceptance criteria:\n{}", issue.acceptance_criteria);
            }
            let labels = store.get_labels(&issue.id)?;
            if !labels.is_empty() {
                println!("\nLabels: {}", labels.join(", "));
            }
            let deps = store.get_dependencies(&issue.id)?;
            if !deps.is_empty() {
                println!("\nDepends on:");
                for dep in deps {
                    println!("  -> {} [{}]: {}", dep.id, dep.status, dep.title);
                }
            }
            let dependents = store.get_dependents(&issue.id)?;
            if !dependents.is_empty() {
                println!("\nBlocks:");
                for dep in dependents {
                    println!("  <- {} [{}]: {}", dep.id, dep.status, dep.title);
                }
            }
        }
        Command::List {
            status,
            assignee,
            limit,
        } => {
            let filter = IssueFilter {
                status: status.as_deref().and_then(Status::parse),
                assignee,
                limit,
                ..Default::default()
            };
            let issues = store.search_issues("", &filter)?;
            println!("Found {} issues:", issues.len());
            for issue in issues {
                println!("{} [P{}] {} - {}", issue.id, issue.priority, issue.status, issue.title);
            }
        }
        Command::Update {
            id,
            title,
            status,
            priority,
            assignee,
        } => {
            let update = IssueUpdate {
                title,
                status: status.as_deref().and_then(Status::parse),
                priority,
                assignee,
                ..Default::default()
            };
            if update.is_empty() {
                println!("No updates specified");
            } else {
                store.update_issue(&id, &update, &actor)?;
                println!("Updated issue {id}");
            }
        }
        Command::Close { ids, reason } => {
            for id in ids {
                match store.close_issue(&id, &reason, &actor) {
                    Ok(()) => println!("Closed {id}: {reason}"),
                    Err(e) => eprintln!("Error closing {id}: {e}"),
                }
            }
        }
        Command::Dep { issue, blocker } => {
            store.add_dependency(
                &Dependency {
                    issue_id: issue.clone(),
                    depends_on: blocker.clone(),
                },
                &actor,
            )?;
            println!("{issue} now depends on {blocker}");
        }
        Command::Events { limit, issue } => {
            let events = store.get_agent_events(&EventFilter {
                issue_id: issue,
                limit: Some(limit),
                ..Default::default()
            })?;
            for event in events {
                println!(
                    "{} [{}] {} {}: {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.severity,
                    event.issue_id.as_deref().unwrap_or("-"),
                    event.event_type,
                    event.message
                );
            }
        }
        Command::Stats => {
            let stats = store.get_statistics()?;
            println!("Open: {}", stats.open);
            println!("In progress: {}", stats.in_progress);
            println!("Blocked: {}", stats.blocked);
            println!("Closed: {}", stats.closed);
            println!("Total: {}", stats.total);
        }
    }

    Ok(())
}

async fn run_executor(store: Arc<Store>, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = ExecutorConfig {
        poll_interval: Duration::from_secs(args.poll_interval),
        enable_ai_supervision: !args.no_ai,
        enable_quality_gates: !args.no_gates,
        enable_sandboxes: !args.no_sandboxes,
        keep_sandbox_on_failure: args.keep_sandbox_on_failure,
        keep_branches: args.keep_branches,
        sandbox_root: args.sandbox_root,
        parent_repo: args.parent_repo,
        default_branch: args.default_branch,
        ..Default::default()
    };
    config.agent.program = args.agent;
    config.agent.timeout = Duration::from_secs(args.agent_timeout);

    let supervisor: Option<Arc<dyn Supervisor>> = match (config.enable_ai_supervision, args.oracle)
    {
        (true, Some(program)) => Some(Arc::new(CommandSupervisor::new(
            program,
            Duration::from_secs(60),
        ))),
        _ => None,
    };

    let executor = Executor::new(config, store, supervisor)?;
    let root = install_shutdown_handler()?;

    executor.start().await?;
    root.cancelled().await;

    let deadline = CancellationToken::new();
    let deadline_clone = deadline.clone();
    let stop_timeout = Duration::from_secs(args.stop_timeout);
    tokio::spawn(async move {
        tokio::time::sleep(stop_timeout).await;
        deadline_clone.cancel();
    });

    executor.stop(&deadline).await?;
    Ok(())
}
