mod cmd;
mod context;
mod output;
mod root;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "opsrun",
    about = "Run scheduled and event-driven tasks with concurrency limits and completion tracking",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest opsrun.yaml walking up from the working directory)
    #[arg(long, global = true, env = "OPSRUN_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default opsrun.yaml
    Init,

    /// Check the config and every task definition
    Validate,

    /// Run one scheduling tick, then dispatch whatever is ready
    Tick {
        /// Evaluate as of this RFC 3339 time instead of now
        #[arg(long)]
        at: Option<String>,
    },

    /// Fire a task immediately, ignoring its schedule and enabled flag
    Fire {
        task: String,
        #[arg(long)]
        at: Option<String>,
    },

    /// Feed a resource event (JSON file, or - for stdin) to the scheduler
    Event {
        file: PathBuf,
        #[arg(long)]
        at: Option<String>,
    },

    /// Run one completion tick: probe waiting instances and refill freed slots
    Complete {
        /// Override the configured probing budget
        #[arg(long)]
        budget_secs: Option<u64>,
        #[arg(long)]
        at: Option<String>,
    },

    /// Bring every concurrency key back within its limit
    Reconcile {
        #[arg(long)]
        at: Option<String>,
    },

    /// Drive the scheduling and completion timers until Ctrl-C
    Run,

    /// List execution instances
    Instances {
        /// Only this status (pending, waiting, started, wait-for-completion, completed, failed, timed-out)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one execution instance
    Show { id: String },

    /// List upcoming firings of a cron expression
    Cron {
        expression: String,
        /// IANA timezone the expression is evaluated in
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(long, default_value = "5")]
        count: usize,
        /// Start from this RFC 3339 time instead of now
        #[arg(long)]
        from: Option<String>,
    },

    /// Evaluate a tag filter expression against Key=Value tags
    Filter {
        expression: String,
        tags: Vec<String>,
    },

    /// List the registered actions
    Actions,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = root::resolve_config(cli.config.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&config),
        Commands::Validate => cmd::validate::run(&config, cli.json),
        Commands::Tick { at } => cmd::tick::run(&config, at.as_deref(), cli.json),
        Commands::Fire { task, at } => cmd::fire::run(&config, &task, at.as_deref(), cli.json),
        Commands::Event { file, at } => cmd::event::run(&config, &file, at.as_deref(), cli.json),
        Commands::Complete { budget_secs, at } => {
            cmd::complete::run(&config, budget_secs, at.as_deref(), cli.json)
        }
        Commands::Reconcile { at } => cmd::reconcile::run(&config, at.as_deref(), cli.json),
        Commands::Run => cmd::daemon::run(&config),
        Commands::Instances { status } => {
            cmd::instances::list(&config, status.as_deref(), cli.json)
        }
        Commands::Show { id } => cmd::instances::show(&config, &id, cli.json),
        Commands::Cron {
            expression,
            tz,
            count,
            from,
        } => cmd::cron::run(&expression, &tz, count, from.as_deref(), cli.json),
        Commands::Filter { expression, tags } => cmd::filter::run(&expression, &tags, cli.json),
        Commands::Actions => cmd::actions::run(cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
