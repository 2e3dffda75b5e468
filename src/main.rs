//! Maintenance CLI for codevec storage directories.
//!
//! Inspects, validates and clears the per-project stores under the
//! configured `index_path`. Indexing itself is driven by the embedding
//! pipeline through the library API.

use anyhow::{Context, Result, bail};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use codevec::storage::persistence::MODEL_INFO_FILE;
use codevec::{
    ModelInfo, Settings, StorageLayout, StoreError, StoreRegistry, StoreStats, logging,
    vector::default_device,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Exit code when validation finds inconsistencies
const EXIT_INCONSISTENT: i32 = 7;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(
    name = "codevec",
    version = env!("CARGO_PKG_VERSION"),
    about = "Vector storage maintenance",
    long_about = "Inspect, validate and clear per-project vector stores.",
    next_line_help = true,
    styles = clap_cargo_style()
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show counts, dimension, index kind and residency per project
    #[command(about = "Summarize stored projects")]
    Status {
        /// Limit output to one project
        #[arg(short, long)]
        project: Option<String>,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Cross-check index, identifiers and metadata
    #[command(
        about = "Check store consistency",
        after_help = "Exit codes:\n  0  all stores consistent\n  7  at least one issue found"
    )]
    Validate {
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Delete every vector, record and cache file of a project
    #[command(about = "Clear a project store")]
    Clear {
        /// Project to clear
        project: String,

        /// Required to actually delete
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings")]
    Config,
}

#[derive(Debug, Serialize)]
struct ProjectStatus {
    project_id: String,
    #[serde(flatten)]
    stats: StoreStats,
}

fn main() {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => match Settings::load_from(path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Configuration error loading from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Settings::load().unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            Settings::default()
        }),
    };
    logging::init(&settings.logging, cli.debug || settings.debug);

    match run(cli.command, settings) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(store_error) = e.downcast_ref::<StoreError>() {
                for hint in store_error.recovery_suggestions() {
                    eprintln!("  hint: {hint}");
                }
            }
            std::process::exit(1);
        }
    }
}

fn run(command: Commands, settings: Settings) -> Result<i32> {
    if let Commands::Config = command {
        println!("Current Configuration:");
        println!("{}", "=".repeat(50));
        println!("{}", toml::to_string_pretty(&settings)?);
        return Ok(0);
    }

    let registry = StoreRegistry::new(Arc::new(settings), default_device());
    let code = match command {
        Commands::Status { project, json } => status(&registry, project, json)?,
        Commands::Validate { project } => validate(&registry, project)?,
        Commands::Clear { project, force } => clear(&registry, &project, force)?,
        Commands::Config => 0,
    };
    registry.close_all();
    Ok(code)
}

/// Project directories holding a model info file, sorted by name.
fn discover_projects(registry: &StoreRegistry, only: Option<String>) -> Result<Vec<String>> {
    if let Some(project) = only {
        return Ok(vec![project]);
    }

    let root = registry.root();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", root.display())),
    };

    let mut projects = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.path().join(MODEL_INFO_FILE).is_file() {
            projects.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    projects.sort();
    Ok(projects)
}

fn open_project(registry: &StoreRegistry, project: &str) -> Result<codevec::indexing::SharedStore> {
    let layout = StorageLayout::new(registry.project_path(project));
    let Some(model) = ModelInfo::load(&layout)? else {
        bail!("No store found for project '{project}'");
    };
    Ok(registry.get_or_open(project, &model.model_name, model.dimension)?)
}

fn status(registry: &StoreRegistry, only: Option<String>, json: bool) -> Result<i32> {
    let mut statuses = Vec::new();
    for project in discover_projects(registry, only)? {
        let store = open_project(registry, &project)?;
        let stats = store.lock().stats()?;
        statuses.push(ProjectStatus {
            project_id: project,
            stats,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(0);
    }

    if statuses.is_empty() {
        println!("No stores found");
        return Ok(0);
    }
    for status in &statuses {
        let stats = &status.stats;
        println!("{}", status.project_id);
        println!("  Model:      {} ({} dimensions)", stats.model_name, stats.dimension);
        println!(
            "  Vectors:    {} ({} metadata records)",
            stats.vector_count, stats.metadata_count
        );
        println!(
            "  Index:      {}{}",
            stats.index_kind,
            if stats.trained {
                format!(", {} partitions", stats.partitions)
            } else {
                String::new()
            }
        );
        println!("  Residency:  {} via {}", stats.residency, stats.device);
        println!(
            "  Mmap cache: {}",
            if stats.binary_cache_loaded { "loaded" } else { "off" }
        );
    }
    Ok(0)
}

fn validate(registry: &StoreRegistry, only: Option<String>) -> Result<i32> {
    let mut code = 0;
    for project in discover_projects(registry, only)? {
        let store = open_project(registry, &project)?;
        let report = store.lock().validate()?;
        if report.is_consistent {
            println!("{project}: consistent");
        } else {
            code = EXIT_INCONSISTENT;
            println!("{project}: {} issue(s)", report.issues.len());
            for issue in &report.issues {
                println!("  - {issue}");
            }
        }
    }
    Ok(code)
}

fn clear(registry: &StoreRegistry, project: &str, force: bool) -> Result<i32> {
    if !force {
        eprintln!("Refusing to clear '{project}' without --force");
        return Ok(1);
    }
    let layout = StorageLayout::new(registry.project_path(project));
    if ModelInfo::load(&layout)?.is_some() {
        let store = open_project(registry, project)?;
        store.lock().clear()?;
    } else if layout.base_path().is_dir() {
        // Unreadable model info: nothing can be opened, delete the files directly
        layout.remove_all()?;
    } else {
        bail!("No store found for project '{project}'");
    }
    println!("Cleared {project}");
    Ok(0)
}
