use graphload::config::LoaderConfig;
use graphload::pipeline::{BulkLoader, LoadOptions};
use graphload::schema::Schema;
use graphload::store::{GraphStore, MemoryStore};
use graphload::validation::{validate, ValidationReport};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "graphload")]
#[command(about = "Configuration-driven bulk loader from CSV/TSV files into a typed graph store")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the mapping, then load every data file it names
    Load {
        /// Path to the JSON mapping file
        #[arg(short, long)]
        config: PathBuf,

        /// Target database
        #[arg(short, long)]
        database: String,

        /// Delete the database before loading. The in-memory store starts empty on
        /// every run, so this has no effect with it.
        #[arg(long, alias = "cleanMigration")]
        clean_migration: bool,

        /// Define the schema even if the database already exists. The in-memory
        /// store always creates the database, so the schema is always defined.
        #[arg(long, alias = "loadSchema")]
        load_schema: bool,

        /// Let a match-insert write to every matched concept instead of rejecting ambiguous rows
        #[arg(long = "allow-multi-insert", short = 'm', alias = "allowMultiInsert")]
        allow_multi_insert: bool,

        /// Write the loaded graph as JSON
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Only validate the mapping against the schema and the data files
    Validate {
        /// Path to the JSON mapping file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match args.command {
        Commands::Load {
            config,
            database,
            clean_migration,
            load_schema,
            allow_multi_insert,
            dump,
        } => run_load(&config, database, clean_migration, load_schema, allow_multi_insert, dump.as_deref()),
        Commands::Validate { config } => run_validate(&config),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Mapping, schema text and parsed schema; a missing schema file is an error
fn load_inputs(config_path: &Path) -> Result<(LoaderConfig, String, Schema)> {
    let config = LoaderConfig::from_path(config_path)
        .with_context(|| format!("Failed to load mapping {}", config_path.display()))?;
    let schema_path = config
        .schema_path()
        .context("globalConfig.schema is not set")?;
    let schema_text = std::fs::read_to_string(&schema_path)
        .with_context(|| format!("Schema file {} not found", schema_path.display()))?;
    let schema = Schema::parse(&schema_text)
        .with_context(|| format!("Failed to parse schema {}", schema_path.display()))?;
    Ok((config, schema_text, schema))
}

fn report_validation(report: &ValidationReport) -> Result<()> {
    for w in &report.warnings {
        warn!("{}", w);
    }
    for e in &report.errors {
        error!("{}", e);
    }
    if !report.is_ok() {
        bail!("Validation failed with {} error(s)", report.errors.len());
    }
    info!(warnings = report.warnings.len(), "Validation passed");
    Ok(())
}

fn run_validate(config_path: &Path) -> Result<()> {
    let (config, _, schema) = load_inputs(config_path)?;
    let report = validate(&config, &schema);
    println!("{}", report);
    report_validation(&report)
}

fn run_load(
    config_path: &Path,
    database: String,
    clean_migration: bool,
    load_schema: bool,
    allow_multi_insert: bool,
    dump: Option<&Path>,
) -> Result<()> {
    let (config, schema_text, schema) = load_inputs(config_path)?;
    report_validation(&validate(&config, &schema))?;

    let store = MemoryStore::new();
    if clean_migration && store.database_exists(&database)? {
        info!(database = %database, "Deleting database");
        store.delete_database(&database)?;
    }
    let created = !store.database_exists(&database)?;
    if created {
        info!(database = %database, "Creating database");
        store.create_database(&database)?;
    }
    if created || load_schema {
        info!(database = %database, "Defining schema");
        store.define_schema(&database, &schema_text)?;
    }

    let loader = BulkLoader::new(
        config,
        LoadOptions {
            database: database.clone(),
            allow_multi_insert,
        },
    );
    let summary = loader.run(&store).context("Load failed")?;
    println!("{}", summary);

    let graph = store.snapshot(&database)?;
    println!("Instances by type:");
    for (label, count) in graph.count_by_label() {
        println!("  {:<32} {}", label, count);
    }
    if let Some(path) = dump {
        let json = serde_json::to_string_pretty(&graph)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Graph written");
    }
    Ok(())
}
