//! memtier - tiered memory lifecycle CLI
//!
//! Operator commands over a memtier store.
//!
//! ## Commands
//!
//! - `init-config`: Write the default configuration to a file
//! - `save`: Store a memory, routed to a tier by its score
//! - `recall`: Scoped, ranked retrieval (optionally assembled as context)
//! - `run-policies`: Trim, migrate, summarize, aggregate and cluster
//! - `cluster`: Rebuild and list an owner's topic clusters
//! - `stats`: Tier counts, tier plan and clusters
//! - `inspect`: Explain one record's score and migration schedule

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memtier_core::telemetry::init_tracing;
use memtier_core::{
    merge_values, override_from_pair, ContextFormat, ContextStyle, MemoryManager, MemtierConfig,
    Scope, SearchRequest,
};
use memtier_store::{MemoryId, MemoryStore, Metadata, NewMemory, SurrealMemoryStore};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "memtier")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tiered memory lifecycle engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "MEMTIER_CONFIG")]
    config: Option<PathBuf>,

    /// Override a config value, e.g. `--set recall.default_top_k=5`
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// SurrealDB URL (`mem://`, `surrealkv://path`, `ws://host`); defaults to the environment
    #[arg(long, global = true, env = "MEMTIER_DB_URL")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    InitConfig {
        /// Output path
        #[arg(default_value = "memtier.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Store a memory
    Save {
        /// Owning user
        #[arg(short, long)]
        owner: String,

        /// Memory text
        content: String,

        /// Conversation thread
        #[arg(short, long)]
        thread: Option<String>,

        /// Privacy namespace (defaults to privacy.default_namespace)
        #[arg(long)]
        namespace: Option<String>,

        /// Explicit tier, bypassing write routing
        #[arg(long)]
        tier: Option<String>,

        /// Metadata entries as key=value; values parse as JSON when possible
        #[arg(short, long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
    },

    /// Retrieve ranked memories
    Recall {
        /// Owning user (optional for global scope)
        #[arg(short, long)]
        owner: Option<String>,

        /// Conversation thread
        #[arg(short, long)]
        thread: Option<String>,

        /// thread | topic | user | global (default: recall.scope)
        #[arg(short, long)]
        scope: Option<String>,

        /// Topic for topic scope
        #[arg(long)]
        topic: Option<String>,

        /// Namespace filter
        #[arg(long)]
        namespace: Option<String>,

        /// Maximum results (default: recall.default_top_k)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Assemble as context: structured | simple | chat
        #[arg(long)]
        format: Option<String>,

        /// Render assembled context as text: conversational | bullet | compact
        #[arg(long)]
        style: Option<String>,
    },

    /// Run retention policies
    RunPolicies {
        /// Limit the run to one owner
        #[arg(short, long)]
        owner: Option<String>,
    },

    /// Rebuild and list topic clusters
    Cluster {
        /// Owning user
        #[arg(short, long)]
        owner: String,

        /// Only list clusters with this topic
        #[arg(long)]
        topic: Option<String>,

        /// List without rebuilding
        #[arg(long)]
        no_rebuild: bool,

        /// Maximum clusters to list
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show tier counts and the tier plan
    Stats {
        /// Limit to one owner (also lists their clusters)
        #[arg(short, long)]
        owner: Option<String>,
    },

    /// Explain a record's score and migration schedule
    Inspect {
        /// Memory id
        id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref(), &cli.overrides)?;

    if let Commands::InitConfig { path, force } = &cli.command {
        return cmd_init_config(&config, path, *force);
    }

    let store = open_store(cli.db.as_deref()).await?;
    let manager = MemoryManager::new(store, config).context("Failed to build memory manager")?;
    let out = Output { json: cli.json };

    match cli.command {
        Commands::InitConfig { .. } => Ok(()),
        Commands::Save {
            owner,
            content,
            thread,
            namespace,
            tier,
            meta,
        } => {
            let metadata = parse_metadata(&meta)?;
            let mut memory = NewMemory::new(owner, content).with_metadata(metadata);
            memory.thread = thread;
            memory.namespace = namespace;
            memory.tier = tier;
            cmd_save(&manager, memory, out).await
        }
        Commands::Recall {
            owner,
            thread,
            scope,
            topic,
            namespace,
            top_k,
            format,
            style,
        } => {
            let request = build_request(owner, thread, scope.as_deref(), topic, namespace, top_k)?;
            cmd_recall(&manager, &request, format.as_deref(), style.as_deref(), out).await
        }
        Commands::RunPolicies { owner } => cmd_run_policies(&manager, owner.as_deref(), out).await,
        Commands::Cluster {
            owner,
            topic,
            no_rebuild,
            limit,
        } => cmd_cluster(&manager, &owner, topic.as_deref(), !no_rebuild, limit, out).await,
        Commands::Stats { owner } => cmd_stats(&manager, owner.as_deref(), out).await,
        Commands::Inspect { id } => cmd_inspect(&manager, MemoryId(id), out).await,
    }
}

/// Config from defaults, the optional file and `--set` overrides.
fn load_config(path: Option<&Path>, overrides: &[String]) -> Result<MemtierConfig> {
    let overrides = if overrides.is_empty() {
        None
    } else {
        let mut doc = toml::Value::Table(toml::Table::new());
        for pair in overrides {
            merge_values(&mut doc, override_from_pair(pair)?);
        }
        Some(doc)
    };
    MemtierConfig::load(path, overrides).context("Failed to load memtier configuration")
}

async fn open_store(url: Option<&str>) -> Result<Arc<dyn MemoryStore>> {
    let store = match url {
        Some(url) => SurrealMemoryStore::connect(url).await,
        None => SurrealMemoryStore::from_env().await,
    }
    .context("Failed to connect to memtier database")?;
    Ok(Arc::new(store))
}

/// Parse `key=value` pairs; values that are valid JSON keep their type.
fn parse_metadata(pairs: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("metadata entry {pair:?} is not key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("metadata entry {pair:?} has an empty key");
        }
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn build_request(
    owner: Option<String>,
    thread: Option<String>,
    scope: Option<&str>,
    topic: Option<String>,
    namespace: Option<String>,
    top_k: Option<usize>,
) -> Result<SearchRequest> {
    let mut request = match owner {
        Some(owner) => SearchRequest::for_owner(owner),
        None => SearchRequest::global(),
    };
    if let Some(scope) = scope {
        request = request.scope(scope.parse::<Scope>()?);
    } else if request.owner.is_none() {
        request = request.scope(Scope::Global);
    }
    if let Some(thread) = thread {
        request = request.thread(thread);
    }
    if let Some(topic) = topic {
        request = request.metadata(Metadata::new().with("topic", topic));
    }
    if let Some(namespace) = namespace {
        request = request.namespace(namespace);
    }
    if let Some(top_k) = top_k {
        request = request.top_k(top_k);
    }
    Ok(request)
}

#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit<T: Serialize>(self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

/// Write the effective configuration to `path`
fn cmd_init_config(config: &MemtierConfig, path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let text = config.to_toml_string()?;
    std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote configuration to {}", path.display());
    Ok(())
}

async fn cmd_save(manager: &MemoryManager, memory: NewMemory, out: Output) -> Result<()> {
    let id = manager.save(memory).await?;
    let record = manager
        .store()
        .get(id)
        .await?
        .with_context(|| format!("memory {id} vanished after insert"))?;
    info!(memory_id = %id, tier = %record.tier, "saved memory");
    out.emit(&record, || {
        format!(
            "Saved memory {} to {} (score {})",
            record.id,
            record.tier,
            record.score.map_or_else(|| "-".to_string(), |s| s.to_string())
        )
    })
}

async fn cmd_recall(
    manager: &MemoryManager,
    request: &SearchRequest,
    format: Option<&str>,
    style: Option<&str>,
    out: Output,
) -> Result<()> {
    if format.is_none() && style.is_none() {
        let hits = manager.recall(request).await?;
        return out.emit(&hits, || {
            if hits.is_empty() {
                return "No memories found".to_string();
            }
            hits.iter()
                .map(|hit| {
                    format!(
                        "[{:>3}] #{} {} {}",
                        hit.score,
                        hit.record.id,
                        hit.record.tier,
                        hit.record.content
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
    }

    let format = format
        .map(str::parse::<ContextFormat>)
        .transpose()?
        .unwrap_or_default();
    let context = manager.recall_context(request, format).await?;
    match style {
        Some(style) => {
            let style: ContextStyle = style.parse()?;
            println!("{}", manager.assembler().render(&context, style));
            Ok(())
        }
        None => {
            println!("{}", serde_json::to_string_pretty(&context)?);
            Ok(())
        }
    }
}

async fn cmd_run_policies(manager: &MemoryManager, owner: Option<&str>, out: Output) -> Result<()> {
    let summary = manager.run_policies(owner).await;
    manager.metrics().flush();
    out.emit(&summary, || {
        let mut lines = vec![
            format!("Policy run {}", summary.run_id),
            format!("  migrated:         {}", summary.migrated),
            format!("  trimmed:          {}", summary.trimmed),
            format!("  summarized:       {}", summary.summarized),
            format!("  thread summaries: {}", summary.thread_summaries),
            format!("  clusters:         {}", summary.clusters),
        ];
        for (tier, count) in &summary.by_tier {
            lines.push(format!("  {tier}: {count}"));
        }
        if !summary.failed_steps.is_empty() {
            lines.push(format!("  failed steps: {}", summary.failed_steps.join(", ")));
        }
        lines.join("\n")
    })
}

async fn cmd_cluster(
    manager: &MemoryManager,
    owner: &str,
    topic: Option<&str>,
    rebuild: bool,
    limit: usize,
    out: Output,
) -> Result<()> {
    if rebuild {
        let upserted = manager.rebuild_clusters(owner).await?;
        info!(owner, upserted, "rebuilt clusters");
    }
    let clusters = manager.clusters(owner, topic, limit).await?;
    out.emit(&clusters, || {
        if clusters.is_empty() {
            return format!("No clusters for {owner}");
        }
        clusters
            .iter()
            .map(|c| {
                format!(
                    "{} {}/{} ({} members): {}",
                    c.id.0, c.topic, c.category, c.member_count, c.summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

async fn cmd_stats(manager: &MemoryManager, owner: Option<&str>, out: Output) -> Result<()> {
    let stats = manager.stats(owner).await?;
    let clusters = match owner {
        Some(owner) => manager.clusters(owner, None, 50).await?,
        None => Vec::new(),
    };

    #[derive(Serialize)]
    struct StatsOutput<'a> {
        #[serde(flatten)]
        stats: &'a memtier_core::MemoryStats,
        #[serde(skip_serializing_if = "<[_]>::is_empty")]
        cluster_list: &'a [memtier_core::ClusterRecord],
    }

    out.emit(
        &StatsOutput {
            stats: &stats,
            cluster_list: &clusters,
        },
        || {
            let mut lines = vec![format!(
                "{} memories{}",
                stats.total,
                owner.map(|o| format!(" for {o}")).unwrap_or_default()
            )];
            for tier in &stats.tiers {
                let expiry = tier
                    .expiry_days
                    .map_or_else(|| "no expiry".to_string(), |d| format!("{d}d"));
                let next = tier.next.as_deref().unwrap_or("-");
                lines.push(format!(
                    "  {:<12} {:>6}  {expiry} -> {next}",
                    tier.name, tier.records
                ));
            }
            for c in &clusters {
                lines.push(format!(
                    "  cluster {}/{}: {} members",
                    c.topic, c.category, c.member_count
                ));
            }
            lines.join("\n")
        },
    )
}

async fn cmd_inspect(manager: &MemoryManager, id: MemoryId, out: Output) -> Result<()> {
    let Some(inspection) = manager.inspect(id).await? else {
        bail!("memory {id} not found");
    };
    out.emit(&inspection, || {
        let s = &inspection.score;
        format!(
            "#{} [{}] score {} (importance {:.2}, recency {:.2}, repetition {:.2}, bonus {:.1})\n\
             next tier: {}  due: {}\n{}",
            inspection.record.id,
            inspection.record.tier,
            s.total,
            s.importance,
            s.recency,
            s.repetition,
            s.bonus,
            inspection.next_tier.as_deref().unwrap_or("-"),
            inspection
                .migrates_at
                .map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
            inspection.record.content
        )
    })
}
