use std::fs;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tally_reconcile::{BatchResult, BatchStatus};
use tally_runtime::Engine;
use tally_schemas::{EntityId, Micros};
use tally_store::MemoryStore;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Total reconciliation engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run one payment event file through the coordinator
    Process {
        /// Layered config paths in merge order (default: TALLY_CONFIG or config/base.yaml)
        #[arg(long = "config")]
        config_paths: Vec<String>,

        /// Event JSON file
        #[arg(long)]
        event: String,

        /// Prior total for the memory backend, as ENTITY=DECIMAL (repeatable)
        #[arg(long = "seed")]
        seeds: Vec<String>,

        /// Print the batch result as JSON instead of key=value lines
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Read the current stored total for one entity
    Total {
        #[arg(long = "config")]
        config_paths: Vec<String>,

        entity: String,
    },

    /// Recompute one entity's total from its units-sold counter
    Recompute {
        #[arg(long = "config")]
        config_paths: Vec<String>,

        /// Units-sold counter for the memory backend
        #[arg(long)]
        units: Option<u64>,

        entity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Silent if the file does not exist.
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = tally_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Process {
            config_paths,
            event,
            seeds,
            json,
        } => {
            let engine = boot(&config_paths)?;
            for seed in &seeds {
                let (entity, total) = parse_seed(seed)?;
                memory_backend(&engine, "--seed")?.seed_total(&entity, total);
            }

            let body = fs::read(&event).with_context(|| format!("read event file failed: {event}"))?;
            let result = engine
                .coordinator
                .handle(&body)
                .await
                .map_err(|e| anyhow::anyhow!("INGEST_FAILED: {e}"))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_batch(&result);
            }
        }

        Commands::Total {
            config_paths,
            entity,
        } => {
            let engine = boot(&config_paths)?;
            let entity = EntityId::new(&entity)?;
            let total = engine
                .coordinator
                .reconciler()
                .current_total(&entity)
                .await?;
            println!("entity_id={entity}");
            match total {
                Some(t) => println!("total={t}"),
                None => println!("total=unset"),
            }
        }

        Commands::Recompute {
            config_paths,
            units,
            entity,
        } => {
            let engine = boot(&config_paths)?;
            let entity = EntityId::new(&entity)?;
            if let Some(units) = units {
                memory_backend(&engine, "--units")?.set_units_sold(&entity, units);
            }
            let total = engine.coordinator.reconciler().recompute(&entity).await?;
            println!("entity_id={entity}");
            println!("total={total}");
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}

fn boot(config_paths: &[String]) -> Result<Engine> {
    let paths = tally_runtime::config_paths(config_paths);
    let (loaded, engine) = tally_runtime::boot(&paths)
        .with_context(|| format!("engine boot failed (config: {})", paths.join(",")))?;
    tracing::info!(config_hash = %loaded.config_hash, "configuration loaded");
    Ok(engine)
}

fn memory_backend<'a>(engine: &'a Engine, flag: &str) -> Result<&'a MemoryStore> {
    match engine.memory.as_deref() {
        Some(mem) => Ok(mem),
        None => bail!("{flag} requires store.backend=memory"),
    }
}

fn parse_seed(raw: &str) -> Result<(EntityId, Micros)> {
    let Some((entity, total)) = raw.split_once('=') else {
        bail!("invalid --seed '{raw}': expected ENTITY=DECIMAL");
    };
    let entity = EntityId::new(entity)?;
    let total = Micros::parse_decimal(total.trim())
        .map_err(|e| anyhow::anyhow!("invalid --seed '{raw}': {e}"))?;
    Ok((entity, total))
}

fn print_batch(r: &BatchResult) {
    println!("event_id={}", r.event_id);
    match &r.status {
        BatchStatus::Processed => println!("status=processed"),
        BatchStatus::Skipped { reason } => {
            println!("status=skipped");
            println!("skip_reason={reason}");
        }
    }
    println!("processed_count={}", r.processed_count);
    println!("skipped_count={}", r.skipped_count);
    println!("failure_count={}", r.failures.len());
    for t in &r.totals {
        println!(
            "total entity_id={} units={} contribution={} new_total={}",
            t.entity_id, t.units, t.contribution, t.new_total
        );
    }
    for f in &r.failures {
        println!(
            "failure entity_id={} kind={} message={}",
            f.entity_id,
            f.error_kind.as_str(),
            f.message
        );
    }
}
