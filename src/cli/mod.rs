pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use crate::storage::ExportFormat;
use crate::utils::default_log_file;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file (the data directory's logs/crawler.log
    /// when no path is given)
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<Option<PathBuf>>,

    /// Configuration file to use instead of the default profile
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Named site profile from the config directory
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a list of URLs
    Run(RunArgs),

    /// Inspect and manage saved progress
    Progress {
        #[command(subcommand)]
        action: ProgressAction,
    },

    /// Inspect learned site patterns
    Patterns {
        #[command(subcommand)]
        action: PatternAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Flags for a run. Anything left unset comes from the configuration file.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// File with one URL per line, or a comma-separated list
    #[arg(required = true)]
    pub urls: String,

    /// Maximum fetches in flight
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Maximum fetches in flight per domain
    #[arg(long)]
    pub per_domain: Option<usize>,

    /// Global requests per second
    #[arg(long)]
    pub rate_limit: Option<f64>,

    /// Requests per second per domain
    #[arg(long)]
    pub domain_rate_limit: Option<f64>,

    /// Minimum random delay between requests, in seconds
    #[arg(long)]
    pub min_delay: Option<f64>,

    /// Maximum random delay between requests, in seconds
    #[arg(long)]
    pub max_delay: Option<f64>,

    /// Retries per URL
    #[arg(short, long)]
    pub retries: Option<u32>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Do not track progress (no resume)
    #[arg(long)]
    pub no_progress: bool,

    /// Task id for progress tracking
    #[arg(long)]
    pub task_id: Option<String>,

    /// Render without a visible browser window
    #[arg(long, overrides_with = "no_headless")]
    pub headless: bool,

    /// Render with a visible browser window
    #[arg(long, overrides_with = "headless")]
    pub no_headless: bool,

    #[arg(long)]
    pub user_agent: Option<String>,

    /// Proxy URL for all requests
    #[arg(long)]
    pub proxy: Option<String>,

    /// Rendering service to fetch through instead of plain HTTP
    #[arg(long)]
    pub browser_service: Option<String>,

    /// Directory for progress and learned patterns
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Do not read or update learned patterns
    #[arg(long)]
    pub no_learn: bool,

    /// Write results to this JSON file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ProgressAction {
    /// List all saved tasks
    List,
    /// List tasks that can be resumed
    Resumable,
    /// Show one task
    Status { task_id: String },
    /// Delete one task's progress
    Delete { task_id: String },
    /// Delete completed tasks older than N days
    Cleanup {
        #[arg(default_value_t = 7)]
        days: i64,
    },
    /// Export a task's scraped data
    Export {
        task_id: String,
        output: PathBuf,
        #[arg(short, long, value_enum, default_value_t = FormatArg::Json)]
        format: FormatArg,
    },
}

#[derive(Subcommand)]
enum PatternAction {
    /// Totals across all sites
    Stats,
    /// Print stored patterns
    Show {
        /// Only this origin, e.g. https://example.com
        #[arg(long)]
        domain: Option<String>,
    },
    /// Stop using the pattern that matches this URL
    Retire { url: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List site profiles
    Profiles,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Json,
    Jsonl,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Json => ExportFormat::Json,
            FormatArg::Jsonl => ExportFormat::JsonLines,
        }
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

impl Cli {
    /// Log file requested with `--log-file`, if any
    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|path| path.clone().unwrap_or_else(default_log_file))
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let source = commands::ConfigSource {
        path: cli.config,
        profile: cli.profile,
    };

    match cli.command {
        Commands::Run(args) => {
            info!("Starting run for {}", args.urls);
            commands::run(&source, args).await
        }
        Commands::Progress { action } => {
            let config = source.load()?;
            let data_dir = config.storage.data_dir;
            match action {
                ProgressAction::List => commands::list_progress(&data_dir, false).await,
                ProgressAction::Resumable => commands::list_progress(&data_dir, true).await,
                ProgressAction::Status { task_id } => commands::progress_status(&data_dir, &task_id).await,
                ProgressAction::Delete { task_id } => commands::delete_progress(&data_dir, &task_id).await,
                ProgressAction::Cleanup { days } => commands::cleanup_progress(&data_dir, days).await,
                ProgressAction::Export { task_id, output, format } => {
                    commands::export_progress(&data_dir, &task_id, &output, format.into()).await
                }
            }
        }
        Commands::Patterns { action } => {
            let config = source.load()?;
            let data_dir = config.storage.data_dir;
            match action {
                PatternAction::Stats => commands::pattern_stats(&data_dir).await,
                PatternAction::Show { domain } => commands::show_patterns(&data_dir, domain.as_deref()).await,
                PatternAction::Retire { url } => commands::retire_pattern(&data_dir, &url).await,
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::show_config(&source),
            ConfigAction::Init { force } => commands::init_config(force),
            ConfigAction::Profiles => commands::list_profiles(),
        },
    }
}
