//! Operator CLI for the review engine.
//!
//! `clap` derive shape lifted from the teacher's `audit-cli` (`Cli`/`Commands`
//! with a global `--verbose`/`--format` pair and one subcommand per
//! operation), repointed at task/repo/revision-marker operations instead of
//! audit/scan/tag commands.

use clap::{Parser, Subcommand};
use colored::Colorize;
use review_engine::db::{self, TaskFilters};
use review_engine::models::{Strategy, TaskStatus};
use review_engine::Config;
use tracing::info;

#[derive(Parser)]
#[command(name = "review-engine-cli")]
#[command(about = "Operator CLI for the review orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
#[clap(rename_all = "kebab-case")]
enum Commands {
    /// Manually enqueue a review task for a configured repo
    Trigger {
        #[arg(value_name = "REPO_ID")]
        repo_id: String,

        #[arg(long, value_enum, default_value = "commit")]
        strategy: CliStrategy,

        #[arg(long)]
        revision_ref: String,

        #[arg(long)]
        base_ref: Option<String>,
    },

    /// List tasks, optionally filtered
    List {
        #[arg(long)]
        repo_id: Option<String>,

        #[arg(long, value_enum)]
        status: Option<CliStatus>,

        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Show one task's full record and issue list
    Show {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Cancel a pending or processing task
    Cancel {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Reset a repo's stored revision marker, forcing the next poll to
    /// treat every subsequent commit/MR as new
    ResetMarker {
        #[arg(value_name = "REPO_ID")]
        repo_id: String,
    },

    /// List configured repos
    Repos,

    /// Print aggregate task/repo counters
    Stats,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliStrategy {
    Commit,
    MergeRequest,
}

impl From<CliStrategy> for Strategy {
    fn from(value: CliStrategy) -> Self {
        match value {
            CliStrategy::Commit => Strategy::Commit,
            CliStrategy::MergeRequest => Strategy::MergeRequest,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl From<CliStatus> for TaskStatus {
    fn from(value: CliStatus) -> Self {
        match value {
            CliStatus::Pending => TaskStatus::Pending,
            CliStatus::Processing => TaskStatus::Processing,
            CliStatus::Completed => TaskStatus::Completed,
            CliStatus::Failed => TaskStatus::Failed,
            CliStatus::Cancelled => TaskStatus::Cancelled,
        }
    }
}

#[tokio::main]
async fn main() -> review_engine::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    let config = Config::load()?;
    let pool = db::init_db(&config.database_url()).await?;

    match cli.command {
        Commands::Trigger { repo_id, strategy, revision_ref, base_ref } => {
            let repo = db::get_repository(&pool, &repo_id).await?;
            let task = review_engine::models::ReviewTask {
                task_id: uuid::Uuid::new_v4().to_string(),
                repo_id: repo.repo_id.clone(),
                strategy: strategy.into(),
                revision_ref: revision_ref.clone(),
                base_ref: base_ref.unwrap_or(revision_ref),
                branch: repo.branch.clone(),
                author_name: None,
                author_email: None,
                created_at: chrono::Utc::now(),
                started_at: None,
                finished_at: None,
                status: TaskStatus::Pending,
                batch_total: 0,
                batch_current: 0,
                batch_results: Vec::new(),
                issues_count: 0,
                critical_count: 0,
                warning_count: 0,
                suggestion_count: 0,
                quality_score: 0,
                files_reviewed: Vec::new(),
                report: None,
                processing_time_seconds: None,
                verdict: None,
                risk_level: None,
                fail_reason: None,
            };
            let task_id = db::create_task(&pool, &task).await?;
            info!(task_id, "task created; start the server process to have it picked up");
            println!("{} {}", "✓".green(), task_id);
        }

        Commands::List { repo_id, status, limit, offset } => {
            let filters = TaskFilters { repo_id, status: status.map(Into::into), strategy: None };
            let tasks = db::query_tasks(&pool, &filters, limit, offset).await?;
            print_output(&cli.format, &tasks);
        }

        Commands::Show { task_id } => {
            let task = db::get_full_task(&pool, &task_id).await?;
            let issues = db::list_issues(&pool, &task_id).await?;
            print_output(&cli.format, &(task, issues));
        }

        Commands::Cancel { task_id } => {
            let status = db::cancel_task(&pool, &task_id).await?;
            println!("{} task {task_id} now {status}", "✓".green());
        }

        Commands::ResetMarker { repo_id } => {
            let repo = db::get_repository(&pool, &repo_id).await?;
            db::reset_revision_marker(&pool, &repo_id, &repo.branch, review_engine::models::RevisionKind::Commit).await?;
            db::reset_revision_marker(&pool, &repo_id, &repo.branch, review_engine::models::RevisionKind::Mr).await?;
            println!("{} revision markers reset for {repo_id}", "✓".green());
        }

        Commands::Repos => {
            let repos = db::list_repositories(&pool).await?;
            print_output(&cli.format, &repos);
        }

        Commands::Stats => {
            let stats = db::get_stats(&pool).await?;
            print_output(&cli.format, &stats);
        }
    }

    Ok(())
}

fn print_output<T: serde::Serialize + std::fmt::Debug>(format: &OutputFormat, value: &T) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("failed to serialize output: {e}"),
        },
        OutputFormat::Text => println!("{value:#?}"),
    }
}
