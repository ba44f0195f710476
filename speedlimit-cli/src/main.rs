//! speedlimit-db CLI - connection diagnostics for the Speed Limit tools
//!
//! - `config`: show the resolved connection target and pool settings
//! - `ping`: round-trip `SELECT 1` through the shared connection path
//! - `value`: run a scalar query

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use speedlimit_db::config::pooling_disabled;
use speedlimit_db::{fetch_value, load_dotenv, pooling_available, ConnectionParams, PoolSettings};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "speedlimit-db",
    author,
    version,
    about = "Inspect and test the Speed Limit database connection",
    long_about = "Resolves connection settings the same way every Speed Limit tool does \
                  (PGHOST/PGPORT/PGDATABASE/PGUSER/PGPASSWORD or SPEEDLIMIT_DATABASE_URL) \
                  and runs quick checks against the database."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the resolved connection target and pool settings (no network access)
    Config(ConfigArgs),
    /// Check that the database answers `SELECT 1`
    Ping,
    /// Run a scalar query and print the first column of the first row as JSON
    Value(ValueArgs),
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Print as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct ValueArgs {
    /// SQL query with $1, $2, ... placeholders
    query: String,

    /// Positional parameters, parsed as JSON when possible, otherwise text
    params: Vec<String>,
}

#[derive(Serialize, Debug)]
struct ConfigReport {
    target: String,
    pooling: &'static str,
    min_size: u32,
    max_size: u32,
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

fn pooling_state() -> &'static str {
    if !pooling_available() {
        "unavailable"
    } else if pooling_disabled() {
        "disabled"
    } else {
        "enabled"
    }
}

fn run_config(args: ConfigArgs) -> Result<()> {
    let params = ConnectionParams::from_env();
    let settings = PoolSettings::from_env();
    let report = ConfigReport {
        target: params.describe(),
        pooling: pooling_state(),
        min_size: settings.min_size,
        max_size: settings.max_size,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("target:   {}", report.target);
        println!("pooling:  {}", report.pooling);
        println!("min_size: {}", report.min_size);
        println!("max_size: {}", report.max_size);
    }
    Ok(())
}

async fn run_ping() -> Result<()> {
    let target = ConnectionParams::from_env().describe();
    let value = fetch_value("SELECT 1", &[])
        .await
        .with_context(|| format!("Failed to reach {target}"))?;

    match value {
        Some(v) if v == Value::from(1) => {
            println!("ok ({target})");
            Ok(())
        }
        other => bail!("unexpected answer to SELECT 1: {other:?}"),
    }
}

fn parse_param(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_value(args: ValueArgs) -> Result<()> {
    let params: Vec<Value> = args.params.iter().map(|p| parse_param(p)).collect();
    debug!(query = %args.query, ?params, "running scalar query");

    match fetch_value(&args.query, &params).await? {
        Some(value) => println!("{}", serde_json::to_string(&value)?),
        None => {
            eprintln!("(no rows)");
            println!("null");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().ok();
    load_dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config(args) => run_config(args)?,
        Commands::Ping => run_ping().await?,
        Commands::Value(args) => run_value(args).await?,
    }

    Ok(())
}
