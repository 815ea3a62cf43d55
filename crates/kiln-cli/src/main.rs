//! CLI binary for building and serving Kiln projects.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiln_cli::{KilnConfig, Mode, Orchestrator, TaskConfig, DEFAULT_CONFIG_FILE};
use kiln_tasks::{RunReport, TaskStatus};

#[derive(Parser)]
#[command(
    name = "kiln",
    version,
    about = "Incremental multi-bundle builds with a supervised dev server"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage except serve and watch, then exit
    Build {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run every stage, then watch and restart the server until Ctrl-C
    Serve {
        /// Extra arguments passed to the server process
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Validate the config file and print a summary
    Check,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Build { json } => cmd_build(&cli.config, json).await?,
        Commands::Serve { args } => cmd_serve(&cli.config, args).await?,
        Commands::Check => cmd_check(&cli.config)?,
    }

    Ok(())
}

async fn cmd_build(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = KilnConfig::load(config_path)?;
    let orchestrator = Orchestrator::new(config, Vec::new())?;
    let report = orchestrator.run(Mode::Build).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_serve(config_path: &Path, args: Vec<String>) -> anyhow::Result<()> {
    let config = KilnConfig::load(config_path)?;
    let orchestrator = Orchestrator::new(config, args)?;
    let report = orchestrator.serve().await?;
    if !report.is_success() {
        print_report(&report);
    }
    Ok(())
}

fn cmd_check(config_path: &Path) -> anyhow::Result<()> {
    let config = KilnConfig::load(config_path)?;

    println!("Config: {}", config_path.display());
    println!("Root: {}", config.project_root().display());
    println!("Output: {}", config.output_dir().display());

    println!("\nBundles:");
    for bundle in &config.bundles {
        let entries: Vec<String> = bundle.entries.iter().map(|e| e.display().to_string()).collect();
        println!(
            "  {} <- {}{}",
            bundle.output,
            entries.join(", "),
            if bundle.debug { " (sourcemap)" } else { "" }
        );
    }

    println!("\nStages:");
    for (index, stage) in config.stages.iter().enumerate() {
        let tasks: Vec<String> = stage
            .tasks
            .iter()
            .map(|name| format!("{} [{}]", name, task_kind(&config.tasks[name])))
            .collect();
        let gate = if stage.requires_success { " (requires success)" } else { "" };
        println!("  {}: {}{}", index, tasks.join(", "), gate);
    }

    if !config.watches.is_empty() {
        println!("\nWatch:");
        for watch in &config.watches {
            println!("  {} -> {}", watch.globs.join(" "), watch.targets.join(", "));
        }
    }

    if let Some(server) = &config.server {
        println!("\nServer: {} {}", server.command, server.args.join(" "));
        if !server.restart_on.is_empty() {
            println!("  restarts on: {}", server.restart_on.join(" "));
        }
    }

    println!("\nConfig is valid");
    Ok(())
}

fn task_kind(task: &TaskConfig) -> &'static str {
    match task {
        TaskConfig::Clean => "clean",
        TaskConfig::Mkdir { .. } => "mkdir",
        TaskConfig::Copy { .. } => "copy",
        TaskConfig::Shell { .. } => "shell",
        TaskConfig::Bundles => "bundles",
        TaskConfig::Serve => "serve",
        TaskConfig::Watch => "watch",
    }
}

fn print_report(report: &RunReport) {
    for task in report.tasks() {
        let (mark, detail) = match &task.status {
            TaskStatus::Succeeded => ("ok", String::new()),
            TaskStatus::Failed(reason) => ("FAILED", format!(": {}", reason)),
            TaskStatus::Skipped => ("skipped", String::new()),
        };
        println!(
            "[{}] {} {} ({}ms){}",
            task.stage, mark, task.name, task.duration_ms, detail
        );
    }
}
