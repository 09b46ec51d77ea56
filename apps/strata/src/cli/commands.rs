//! # CLI Command Implementations

use std::path::Path;
use std::sync::Arc;
use strata::adapter::FixtureAdapter;
use strata::api::{WorkerState, run_worker};
use strata::config::{CONFIG_TEMPLATE, StrataConfig};
use strata::fanout::FanOut;
use strata::pipeline::{Order, Pipeline, PipelineStores, TaskArgs};
use strata::queue::{BatchingSender, MemoryQueue, OrderQueue};
use strata_core::{IdentifierStem, RecordKey, Schema, StrataError};

// =============================================================================
// WORKER COMMAND
// =============================================================================

/// Serve the worker API against the configured stores.
pub async fn cmd_worker(config: &StrataConfig) -> Result<(), StrataError> {
    let stores = PipelineStores::open(&config.storage)?;
    let state = WorkerState::local(stores.tasks(), stores.graph.clone());
    tracing::info!(database = %config.storage.database.display(), "worker stores opened");
    run_worker(state, &config.worker).await
}

// =============================================================================
// MONITOR COMMAND
// =============================================================================

/// One monitor tick for `stem`, then drain every order it produces.
pub async fn cmd_monitor(
    config: &StrataConfig,
    stem: &str,
    json_mode: bool,
) -> Result<(), StrataError> {
    let stem = IdentifierStem::from_raw(stem)?;
    let pipeline = build_pipeline(config)?;

    let queue: Arc<dyn OrderQueue> = Arc::new(MemoryQueue::new());
    let mut seed = BatchingSender::new(queue.clone(), 1);
    seed.send(Order::new(TaskArgs::Monitor {
        identifier_stem: stem.to_string(),
    }))?;
    seed.flush()?;

    let report = pipeline.drain(queue, config.queue.batch_size).await?;

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Monitor Tick");
    println!("============");
    println!("Stem: {}", stem);
    println!();
    for (task, count) in &report.processed {
        println!("{:<12} {}", task, count);
    }
    println!("Orders emitted: {}", report.emitted);
    Ok(())
}

fn build_pipeline(config: &StrataConfig) -> Result<Pipeline, StrataError> {
    let schema = Schema::load(&config.schema.path)?;
    let adapter = Arc::new(FixtureAdapter::load(&config.monitor.source)?);
    let stores = PipelineStores::open(&config.storage)?;
    let fanout = FanOut::from_config(
        Arc::new(stores.tasks()),
        &config.fanout,
        config.worker.api_key.clone(),
    );
    Ok(Pipeline::new(
        schema,
        stores,
        adapter,
        fanout,
        config.monitor.max_claims_per_tick,
    ))
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show graph size.
pub fn cmd_status(config: &StrataConfig, json_mode: bool) -> Result<(), StrataError> {
    let stores = PipelineStores::open(&config.storage)?;
    let vertex_count = stores.graph.vertex_count()?;
    let edge_count = stores.graph.edge_count()?;

    if json_mode {
        let output = serde_json::json!({
            "database": config.storage.database.to_string_lossy(),
            "vertex_count": vertex_count,
            "edge_count": edge_count,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("strata Graph Status");
    println!("===================");
    println!("Database: {:?}", config.storage.database);
    println!();
    println!("Vertices: {}", vertex_count);
    println!("Edges:    {}", edge_count);
    Ok(())
}

// =============================================================================
// RECORD COMMAND
// =============================================================================

/// Show the staged record of one id.
pub fn cmd_record(
    config: &StrataConfig,
    stem: &str,
    id: &str,
    json_mode: bool,
) -> Result<(), StrataError> {
    let stem = IdentifierStem::from_raw(stem)?;
    let key = RecordKey::new(stem.to_string(), id);
    let stores = PipelineStores::open(&config.storage)?;
    let record = stores
        .state
        .get(&key)?
        .ok_or_else(|| StrataError::NotFound(format!("staged record {key}")))?;

    if json_mode {
        println!(
            "{}",
            serde_json::to_string_pretty(&record).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Staged Record");
    println!("=============");
    println!("Key:         {}", record.key);
    println!("Object type: {}", record.object_type);
    println!("Disposition: {:?}", record.disposition);
    println!("Last stage:  {}", record.last_stage_seen);
    for (stage, at) in &record.stage_times {
        println!("  {:<12} {}", stage.as_str(), at.to_rfc3339());
    }
    if !record.potentials.is_empty() {
        println!();
        println!("Candidates:");
        for (potential_id, entry) in &record.potentials {
            let outcome = entry
                .outcome
                .as_ref()
                .map(|o| format!("{:?}", o))
                .unwrap_or_else(|| "pending".to_string());
            let loaded = if entry.committed { "loaded" } else { "not loaded" };
            println!("  {} -> {} ({})", potential_id, outcome, loaded);
        }
    }
    Ok(())
}

// =============================================================================
// STEM COMMAND
// =============================================================================

/// Parse an identifier stem and show its extraction keywords.
pub fn cmd_stem(raw: &str, json_mode: bool) -> Result<(), StrataError> {
    let stem = IdentifierStem::from_raw(raw)?;
    let keywords = stem.for_extractor();

    if json_mode {
        let output = serde_json::json!({
            "canonical": stem.to_string(),
            "graph_type": stem.graph_type().as_str(),
            "object_type": stem.object_type(),
            "stub": stem.is_stub(),
            "keywords": keywords,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return Ok(());
    }

    println!("Canonical:   {}", stem);
    println!("Graph type:  {}", stem.graph_type());
    println!("Object type: {}", stem.object_type());
    println!("Stub:        {}", stem.is_stub());
    println!("Keywords:");
    for (name, value) in &keywords {
        println!("  {} = {}", name, value);
    }
    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Write the configuration template and create the database directory.
pub fn cmd_init(
    config_path: &Path,
    database: Option<&Path>,
    force: bool,
) -> Result<(), StrataError> {
    if config_path.exists() && !force {
        return Err(StrataError::IoError(format!(
            "{} already exists. Use --force to overwrite.",
            config_path.display()
        )));
    }
    std::fs::write(config_path, CONFIG_TEMPLATE)
        .map_err(|e| StrataError::IoError(format!("{}: {e}", config_path.display())))?;

    let mut config = StrataConfig::from_toml_str(CONFIG_TEMPLATE)?;
    if let Some(database) = database {
        config.storage.database = database.to_path_buf();
    }
    PipelineStores::open(&config.storage)?;

    println!("Wrote configuration to {:?}", config_path);
    println!("Initialized database at {:?}", config.storage.database);
    Ok(())
}
