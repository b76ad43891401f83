use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use citegraph_core::{
    AppConfig, GraphStats, NodeIdentity, PlaceholderOutcome, publication_identity,
};
use citegraph_pubmed::{CycleReport, PublicationLoader};

// ─── CLI Definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "citegraph",
    about = "Incremental PubMed citation graph builder",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (defaults to ~/.config/citegraph/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Graph database path, overriding the config file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register publication ids discovered through a parent node.
    Register {
        #[arg(long, default_value = "GoTerm")]
        parent_label: String,
        #[arg(long, default_value = "go_id")]
        parent_property: String,
        #[arg(long)]
        parent_id: String,
        #[arg(required = true)]
        pub_ids: Vec<String>,
    },

    /// Run completion passes now.
    Complete {
        #[arg(long, default_value = "1")]
        repeat: u32,
    },

    /// Run scheduled completion until interrupted.
    Watch {
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// List publications still waiting for their data.
    Placeholders,

    /// Show a publication node.
    Show { pub_id: String },

    /// Graph statistics.
    Stats,

    /// Delete a publication and its abstract section.
    Delete { pub_id: String },
}

// ─── Main ───────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let json_output = cli.json;
    let start = Instant::now();

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides();
            config
        }
        None => AppConfig::load()?,
    };
    if let Some(db) = &cli.db {
        config.graph.database_path = db.to_string_lossy().to_string();
        config.validate()?;
    }

    match cli.command {
        // ── Register ───────────────────────────────────────────────────────

        Commands::Register {
            parent_label,
            parent_property,
            parent_id,
            pub_ids,
        } => {
            let loader = open_loader(&config)?;
            let parent = NodeIdentity::new(parent_label, parent_property, parent_id);
            loader.gateway().ensure_node(&parent)?;

            let mut created = Vec::new();
            let mut existing = Vec::new();
            let mut skipped = Vec::new();
            for pub_id in &pub_ids {
                match loader.register_publication(parent.clone(), pub_id)? {
                    PlaceholderOutcome::Skipped => skipped.push(pub_id.clone()),
                    outcome if outcome.node_created() => created.push(pub_id.clone()),
                    _ => existing.push(pub_id.clone()),
                }
            }
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status":"ok",
                    "data":{"parent":parent.to_string(),"created":created,"existing":existing,"skipped":skipped},
                    "meta":{"duration_ms":dur}
                }))?;
            } else {
                println!("Registered under {parent}:");
                println!("  New placeholders: {}", created.len());
                println!("  Already present:  {}", existing.len());
                if !skipped.is_empty() {
                    println!("  Skipped:          {}", skipped.join(", "));
                }
            }
        }

        // ── Complete ───────────────────────────────────────────────────────

        Commands::Complete { repeat } => {
            let loader = open_loader(&config)?;
            let reports = loader.run_repeated(repeat).await?;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":reports,"meta":{"duration_ms":dur}}))?;
            } else if reports.is_empty() {
                println!("Nothing to do.");
            } else {
                for (i, report) in reports.iter().enumerate() {
                    print_report(i + 1, report);
                }
            }
        }

        // ── Watch ──────────────────────────────────────────────────────────

        Commands::Watch { interval_ms } => {
            let loader = open_loader(&config)?;
            let interval =
                Duration::from_millis(interval_ms.unwrap_or(config.scheduler.interval_ms));
            let scheduled = loader.start_scheduled_completion(interval);
            if !json_output {
                println!(
                    "Watching {} every {}ms. Press Ctrl-C to stop.",
                    config.database_path().display(),
                    interval.as_millis()
                );
            }
            tokio::signal::ctrl_c().await?;
            scheduled.shutdown().await;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":{"stopped":true},"meta":{"duration_ms":dur}}))?;
            } else {
                println!("Stopped.");
            }
        }

        // ── Placeholders ───────────────────────────────────────────────────

        Commands::Placeholders => {
            let loader = open_loader(&config)?;
            let ids = loader.gateway().find_placeholder_ids()?;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":ids,"meta":{"duration_ms":dur}}))?;
            } else if ids.is_empty() {
                println!("No placeholders.");
            } else {
                for id in &ids {
                    println!("  {id}");
                }
                println!("{} placeholder(s).", ids.len());
            }
        }

        // ── Show ───────────────────────────────────────────────────────────

        Commands::Show { pub_id } => {
            let loader = open_loader(&config)?;
            let gateway = loader.gateway();
            let identity = publication_identity(pub_id.as_str());
            let Some(properties) = gateway.store().node_properties(&identity)? else {
                if json_output {
                    print_json(&serde_json::json!({"status":"error","error":"not_found","message":format!("Publication {pub_id} not found")}))?;
                } else {
                    eprintln!("Publication not found: {pub_id}");
                }
                std::process::exit(2);
            };
            let roles: Vec<String> = gateway
                .roles(&pub_id)?
                .iter()
                .map(|r| r.label().to_string())
                .collect();
            let complete = gateway.is_complete(&identity)?;
            let parents = gateway.parent_links(&pub_id)?;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status":"ok",
                    "data":{"pub_id":pub_id,"complete":complete,"roles":roles,"properties":properties,"parents":parents},
                    "meta":{"duration_ms":dur}
                }))?;
            } else {
                println!("Publication {pub_id}");
                println!("  Roles:    {}", roles.join(", "));
                println!("  Complete: {complete}");
                for (key, value) in &properties {
                    match value {
                        serde_json::Value::String(s) => println!("  {key}: {s}"),
                        other => println!("  {key}: {other}"),
                    }
                }
                for link in &parents {
                    println!("  <- {} {}", link.rel_type, link.parent);
                }
            }
        }

        // ── Stats ──────────────────────────────────────────────────────────

        Commands::Stats => {
            let loader = open_loader(&config)?;
            let stats = loader.gateway().store().stats()?;
            let placeholders = loader.gateway().find_placeholder_ids()?.len();
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status":"ok",
                    "data":{"graph":stats,"placeholders":placeholders},
                    "meta":{"duration_ms":dur}
                }))?;
            } else {
                print_stats(&stats, placeholders);
            }
        }

        // ── Delete ─────────────────────────────────────────────────────────

        Commands::Delete { pub_id } => {
            let loader = open_loader(&config)?;
            let deleted = loader.delete_publication(&pub_id)?;
            let dur = start.elapsed().as_millis();

            if !deleted {
                if json_output {
                    print_json(&serde_json::json!({"status":"error","error":"not_found","message":format!("Publication {pub_id} not found")}))?;
                } else {
                    eprintln!("Publication not found: {pub_id}");
                }
                std::process::exit(2);
            }
            if json_output {
                print_json(&serde_json::json!({"status":"ok","data":{"deleted":pub_id},"meta":{"duration_ms":dur}}))?;
            } else {
                println!("Deleted publication: {pub_id}");
            }
        }
    }

    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(val: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(val)?);
    Ok(())
}

fn open_loader(config: &AppConfig) -> Result<PublicationLoader> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(PublicationLoader::from_config(config)?)
}

fn print_report(pass: usize, report: &CycleReport) {
    println!("Pass {pass} ({}ms):", report.elapsed_ms);
    println!("  Discovered:   {}", report.discovered);
    println!("  Retrieved:    {}", report.retrieved);
    println!("  Merged:       {}", report.merged);
    println!("  Expanded:     {}", report.expanded);
    println!("  New nodes:    {}", report.placeholders_created);
    for failure in &report.failures {
        println!("  ✗ {} [{:?}]: {}", failure.id, failure.stage, failure.message);
    }
}

fn print_stats(stats: &GraphStats, placeholders: usize) {
    println!("Graph statistics:");
    println!("  Nodes:         {}", stats.nodes);
    println!("  Relationships: {}", stats.relationships);
    println!("  Placeholders:  {placeholders}");
    for (label, count) in &stats.labels {
        println!("  {label:<14} {count}");
    }
}
