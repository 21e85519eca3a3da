//! kex CLI - Command-line interface
//!
//! Usage:
//!   kex extract --org <uuid> --ontology <id> <file>
//!   kex batch --org <uuid> --ontology <id> <files>...
//!   kex retry <batch-id>
//!   kex resume [<execution-id>]
//!   kex status <execution-id>
//!   kex evidence --org <uuid> --entity <uuid>
//!   kex migrate

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use kex_core::{AppConfig, EvidenceQuery, LlmConfig, LoggingConfig, SourceDocument, SourceKey};
use kex_extractor::{create_llm_client, RuleSet, StageSet};
use kex_ontology::{DirectorySource, OntologyCache, OntologyRegistry};
use kex_store::{InMemoryStore, PgStore, Store};
use kex_vector::{
    create_embedding_client, CachedEmbedder, EmbeddingCache, EmbeddingClient, LocalHashEmbedding,
    QdrantStore,
};
use kex_workflow::{BatchOrchestrator, Orchestrator, Pipeline, RunOptions};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "kex")]
#[command(about = "Ontology-guided knowledge extraction")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables take precedence
    #[arg(long, global = true, env = "KEX_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding `<ontology-id>.ttl` files
    #[arg(long, global = true, default_value = "ontologies")]
    ontologies: PathBuf,

    /// Use the rule-backed stages from this file instead of an LLM
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Keep everything in memory, even when a database is configured
    #[arg(long, global = true)]
    memory: bool,

    /// Override the grounding threshold
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a knowledge graph from one document
    Extract {
        #[command(flatten)]
        target: Target,
        /// Document to extract
        file: PathBuf,
        /// Stop after this activity, leaving the execution resumable
        #[arg(long)]
        suspend_after: Option<kex_core::Activity>,
    },
    /// Extract many documents as one batch
    Batch {
        #[command(flatten)]
        target: Target,
        /// Documents to extract
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Recover interrupted items of a batch and retry the failed ones
    Retry { batch_id: Uuid },
    /// Resume one execution, or every interrupted execution
    Resume { execution_id: Option<Uuid> },
    /// Cancel an execution
    Cancel { execution_id: Uuid },
    /// Show an execution and its activity log
    Status { execution_id: Uuid },
    /// List evidence spans (`Evidence.List`)
    Evidence(EvidenceArgs),
    /// Apply database migrations
    Migrate,
}

#[derive(Args)]
struct Target {
    /// Organization id
    #[arg(long)]
    org: Uuid,
    /// Ontology registry id
    #[arg(long)]
    ontology: String,
    /// Provider account the documents come from
    #[arg(long, default_value = "local")]
    account: String,
}

#[derive(Args)]
struct EvidenceArgs {
    #[arg(long)]
    org: Uuid,
    #[arg(long)]
    entity: Option<Uuid>,
    #[arg(long)]
    relation: Option<Uuid>,
    #[arg(long)]
    bullet: Option<Uuid>,
    #[arg(long)]
    document: Option<Uuid>,
}

impl EvidenceArgs {
    fn query(&self) -> anyhow::Result<EvidenceQuery> {
        Ok(match (self.entity, self.relation, self.bullet, self.document) {
            (Some(id), None, None, None) => EvidenceQuery::entity(self.org, id),
            (None, Some(id), None, None) => EvidenceQuery::relation(self.org, id),
            (None, None, Some(id), None) => EvidenceQuery::bullet(self.org, id),
            (None, None, None, Some(id)) => EvidenceQuery::document(self.org, id),
            _ => bail!("exactly one of --entity, --relation, --bullet, --document is required"),
        })
    }
}

#[derive(Serialize)]
struct StatusReport {
    execution: kex_core::WorkflowExecution,
    activities: Vec<kex_core::ActivityRecord>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    if let Some(threshold) = cli.threshold {
        config.grounding.threshold = threshold;
    }
    init_tracing(&config.logging);

    if let Commands::Migrate = cli.command {
        return migrate(&config, cli.memory).await;
    }
    let store = open_store(&config, cli.memory).await?;

    let orchestrator = Arc::new(build_orchestrator(&config, &cli, Arc::clone(&store))?);

    match cli.command {
        Commands::Extract {
            target,
            file,
            suspend_after,
        } => {
            let source = read_source(&target, &file)?;
            let materialized = store.materialize(&source).await?;
            let input = orchestrator.prepare(&materialized.version, &target.ontology).await?;
            let execution = orchestrator.start(input).await?;
            let options = RunOptions {
                suspend_after,
            };
            let outcome = orchestrator.advance(execution, options).await?;
            print_json(outcome.execution())?;
        }
        Commands::Batch { target, files } => {
            let sources = files
                .iter()
                .map(|file| read_source(&target, file))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let batches = BatchOrchestrator::new(orchestrator).with_settings(&config.batch);
            let batch_id = batches.queue_batch(target.org, &target.ontology, &sources).await?;
            info!(batch = %batch_id, "Waiting for batch");
            print_json(&batches.wait(batch_id).await?)?;
        }
        Commands::Retry { batch_id } => {
            let batches = BatchOrchestrator::new(orchestrator).with_settings(&config.batch);
            let recovered = batches.recover(batch_id).await?;
            let report = batches.retry_failed(batch_id).await?;
            info!(
                recovered,
                retried = report.retried,
                abandoned = report.abandoned,
                "Retrying batch items"
            );
            print_json(&batches.wait(batch_id).await?)?;
        }
        Commands::Resume { execution_id } => match execution_id {
            Some(id) => {
                let outcome = orchestrator.resume(id, RunOptions::default()).await?;
                print_json(outcome.execution())?;
            }
            None => {
                let outcomes = orchestrator.recover_incomplete().await?;
                let executions: Vec<_> = outcomes.into_iter().map(|o| o.into_execution()).collect();
                print_json(&executions)?;
            }
        },
        Commands::Cancel { execution_id } => {
            print_json(&orchestrator.cancel(execution_id).await?)?;
        }
        Commands::Status { execution_id } => {
            let execution = orchestrator.status(execution_id).await?;
            let activities = store.list_activities(execution_id).await?;
            print_json(&StatusReport {
                execution,
                activities,
            })?;
        }
        Commands::Evidence(args) => {
            let spans = store.list_evidence(&args.query()?).await?;
            print_json(&spans)?;
        }
        Commands::Migrate => {}
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{},sqlx=warn", logging.level).into());
    if logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn open_store(config: &AppConfig, memory: bool) -> anyhow::Result<Arc<dyn Store>> {
    if memory || config.database.postgres_url.is_none() {
        info!("Using in-memory store");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let store = PgStore::from_config(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    Ok(Arc::new(store))
}

async fn migrate(config: &AppConfig, memory: bool) -> anyhow::Result<()> {
    if memory || config.database.postgres_url.is_none() {
        bail!("migrate needs DATABASE_URL and no --memory");
    }
    PgStore::from_config(&config.database).await?.migrate().await?;
    info!("Migrations applied");
    Ok(())
}

fn build_orchestrator(config: &AppConfig, cli: &Cli, store: Arc<dyn Store>) -> anyhow::Result<Orchestrator> {
    let dimension = config.database.vector_dimension;
    let (stages, embedder): (StageSet, Arc<dyn EmbeddingClient>) = match &cli.rules {
        Some(path) => {
            let rules = RuleSet::from_file(path)?;
            (StageSet::rules(&rules)?, Arc::new(LocalHashEmbedding::new(dimension)))
        }
        None => (llm_stages(&config.llm)?, create_embedding_client(&config.llm, dimension)?),
    };
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(CachedEmbedder::new(
        embedder,
        EmbeddingCache::with_settings(&config.cache),
    ));

    let mut pipeline = Pipeline::from_config(config, store, stages, embedder)?;
    if config.database.qdrant_url.is_some() && !cli.memory {
        pipeline = pipeline.with_vector_store(Arc::new(QdrantStore::new(&config.database)?));
    } else {
        warn!("No vector store configured; the index activity will be skipped");
    }

    let registry = OntologyRegistry::new(Arc::new(DirectorySource::new(&cli.ontologies)))
        .with_cache(OntologyCache::new(config.cache.ontology_max_capacity));
    Ok(Orchestrator::new(pipeline, registry).with_settings(&config.workflow))
}

fn llm_stages(config: &LlmConfig) -> anyhow::Result<StageSet> {
    let client = create_llm_client(config).context("No LLM available; pass --rules for offline extraction")?;
    Ok(StageSet::llm(Arc::from(client)))
}

fn read_source(target: &Target, file: &Path) -> anyhow::Result<SourceDocument> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let source_id = file.to_string_lossy().into_owned();
    Ok(SourceDocument::new(
        SourceKey::new(target.org, target.account.clone(), source_id),
        content,
    ))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
