mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::Project;

#[derive(Parser)]
#[command(name = "sqlmig")]
#[command(about = "Apply and roll back timestamped SQLite migrations", version)]
struct Cli {
    /// Project root holding the migrations directory and database
    #[arg(long, global = true, env = "SQLMIG_ROOT", default_value = "sqlmig")]
    root: PathBuf,

    /// Config file (defaults to sqlmig.yml, sqlmig.yaml or sqlmig.toml in the root)
    #[arg(long, global = true, env = "SQLMIG_CONFIG")]
    config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the project root, migrations directory and bookkeeping tables
    Init,

    /// Write a new migration file and register it as pending
    Create {
        /// Short name, e.g. "create users"
        name: String,
    },

    /// List pending and applied migrations
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply all pending migrations in timestamp order
    Update,

    /// Roll back the most recently applied migration
    Rollback,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let project = Project::load(&cli.root, cli.config.as_deref())?;
    let mut out = std::io::stdout().lock();

    match cli.command {
        Commands::Init => commands::init(&project, &mut out),
        Commands::Create { name } => commands::create(&project, &name, &mut out),
        Commands::Status { json } => commands::status(&project, json, &mut out),
        Commands::Update => commands::update(&project, &mut out),
        Commands::Rollback => commands::rollback(&project, &mut out),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "sqlmig=debug,sqlmig_db=debug,sqlmig_config=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
