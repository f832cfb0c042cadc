use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use genqueue::backend::SimulatedBackend;
use genqueue::callbacks::ChannelDispatcher;
use genqueue::compiler::{WorkflowCompiler, placeholders};
use genqueue::config::{CompilerConfig, PoolConfig, SchedulerConfig};
use genqueue::pool::{ResourcePool, SizeClass};
use genqueue::scheduler::{Scheduler, StepOutcome};
use genqueue::steps::{StepCatalog, StepTemplate};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(script_path) = args.next().map(PathBuf::from) else {
        eprintln!("Usage: genqueue <script> [pool.json]");
        std::process::exit(2);
    };
    let pool_path = args.next().map(PathBuf::from);

    let config = SchedulerConfig::from_env()?;
    let pool_config = match &pool_path {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("loading pool layout from {}", path.display()))?,
        None => PoolConfig::local(),
    };
    let compiler_config = CompilerConfig::from_env();
    let script = std::fs::read_to_string(&script_path)
        .with_context(|| format!("reading script {}", script_path.display()))?;

    eprintln!("genqueue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Script: {}", script_path.display());
    eprintln!("   Templates: {}", compiler_config.template_dir.display());
    eprintln!(
        "   Pool: {} compute, {} model",
        pool_config.compute_backends.len(),
        pool_config.model_instances.len()
    );

    let catalog = load_catalog(&compiler_config.template_dir)?;
    let dispatcher = Arc::new(ChannelDispatcher::new());
    let mut completions = dispatcher.subscribe();

    let mut scheduler = Scheduler::new(
        config,
        catalog,
        Box::new(ResourcePool::from_config(&pool_config)),
        Arc::new(SimulatedBackend::default()),
        Arc::new(WorkflowCompiler::from_config(&compiler_config)),
        dispatcher,
    );

    let item = scheduler.create_work_item(
        script_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string()),
    );
    let report = scheduler.enqueue_script(item, &script)?;
    for error in &report.errors {
        eprintln!("   skipped: {error}");
    }
    eprintln!("   Enqueued {} step(s)\n", report.enqueued);

    let interrupted = tokio::select! {
        _ = scheduler.run_until_idle() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        eprintln!("Interrupted, cancelling");
        scheduler.force_finish(item)?;
    }

    for entry in scheduler.history(item)? {
        let outcome = match &entry.outcome {
            StepOutcome::Completed => "completed".to_string(),
            StepOutcome::Failed { reason } => format!("failed: {reason}"),
            StepOutcome::Cancelled => "cancelled".to_string(),
        };
        println!("{:<24} {}", entry.step.workflow, outcome);
    }
    while let Ok(completion) = completions.try_recv() {
        println!("{}", serde_json::to_string(&completion)?);
    }

    Ok(())
}

/// Every `*.json` file in the template directory becomes a workflow named
/// after its file stem. `model` and `model_small` call a language model.
fn load_catalog(template_dir: &Path) -> anyhow::Result<StepCatalog> {
    let mut catalog = StepCatalog::new()
        .with(StepTemplate::model_call("model", SizeClass::Large))
        .with(StepTemplate::model_call("model_small", SizeClass::Small));

    if !template_dir.exists() {
        tracing::warn!(dir = %template_dir.display(), "Template directory missing, only model steps available");
        return Ok(catalog);
    }

    for entry in std::fs::read_dir(template_dir)
        .with_context(|| format!("listing templates in {}", template_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let (Some(stem), Some(file)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.file_name().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        match std::fs::read_to_string(&path) {
            Ok(body) => tracing::debug!(
                workflow = stem,
                placeholders = ?placeholders::placeholders(&body),
                "Template registered"
            ),
            Err(e) => tracing::warn!(workflow = stem, error = %e, "Template unreadable, registering anyway"),
        }
        catalog.register(StepTemplate::workflow(stem, file));
    }
    Ok(catalog)
}
