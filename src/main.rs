use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use nl2sql_guard::catalog::{prompt, PgSchemaLoader, SchemaCatalog};
use nl2sql_guard::query::{ExecutionGuard, QueryPipeline};
use nl2sql_guard::session::PgPool;
use nl2sql_guard::{Config, Nl2SqlError};

#[derive(Parser)]
#[command(name = "nl2sql-guard", version)]
#[command(about = "Qualify, validate and safely execute model-proposed SQL against PostgreSQL", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a model proposal and print the outcome as JSON
    Run {
        /// File holding the model output (stdin when omitted)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Rewrite, validate and EXPLAIN a model proposal without executing it
    Check {
        /// File holding the model output (stdin when omitted)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Print the schema snapshot, or the prompt context built from it
    Schema {
        #[arg(long)]
        prompt: bool,
    },
    /// Print connection and catalog diagnostics
    Diagnose,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<Nl2SqlError>() {
            Some(err) => eprintln!("error [{}]: {}", err.kind(), err),
            None => eprintln!("error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config;
    config.validate()?;

    let pool = Arc::new(PgPool::new_with_size(&config.database_url()?, config.pool_size));
    let loader = Arc::new(PgSchemaLoader::new(
        pool.clone(),
        config.schema_whitelist(),
        config.max_columns,
        config.catalog_timeout_ms,
    ));
    let catalog = Arc::new(SchemaCatalog::new(loader.clone(), config.schema_ttl()));

    match cli.command {
        Command::Diagnose => {
            let mut diagnostics = loader.diagnostics(&config.default_schema).await?;
            diagnostics.snapshot_tables = catalog.get().await.ok().map(|state| state.snapshot.tables.len());
            print_json(&diagnostics)
        }
        Command::Schema { prompt: as_prompt } => {
            let state = catalog.get().await?;
            if as_prompt {
                let synonyms = config.load_synonyms()?;
                println!("{}", prompt::schema_context(&state, &synonyms, config.prompt_max_chars));
                Ok(())
            } else {
                print_json(&state.snapshot)
            }
        }
        Command::Run { input } => {
            let raw = read_input(input.as_ref())?;
            let outcome = pipeline(&config, pool, catalog)?.execute(&raw).await?;
            info!(
                "Request {} returned {} rows",
                outcome.request_id,
                outcome.result.as_ref().map_or(0, |r| r.rows.len())
            );
            print_json(&outcome)
        }
        Command::Check { input } => {
            let raw = read_input(input.as_ref())?;
            let outcome = pipeline(&config, pool, catalog)?.check(&raw).await?;
            print_json(&outcome)
        }
    }
}

fn pipeline(config: &Config, pool: Arc<PgPool>, catalog: Arc<SchemaCatalog>) -> Result<QueryPipeline> {
    let synonyms = Arc::new(config.load_synonyms()?);
    let guard = ExecutionGuard::new(
        pool,
        config.explain_timeout_ms,
        config.statement_timeout_ms,
        config.row_limit,
    );
    Ok(QueryPipeline::new(catalog, synonyms, Arc::new(guard), config.default_schema.clone()))
}

fn read_input(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display())),
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw).context("cannot read stdin")?;
            Ok(raw)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
