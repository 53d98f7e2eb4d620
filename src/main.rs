use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use agent_dispatch::config::DispatchConfig;
use agent_dispatch::llm::create_gateway;
use agent_dispatch::pipeline::{BasicRenderer, PhasePipeline, PipelineDeps};
use agent_dispatch::research::SearxClient;
use agent_dispatch::store::{Database, LibSqlBackend};
use agent_dispatch::tasks::{Agent, AgentStatus};
use agent_dispatch::worker::scheduler::poll_interval_arg;
use agent_dispatch::worker::{Scheduler, spawn_scheduler_loop};
use agent_dispatch::workspace::Workspace;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = DispatchConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    if let Some(interval) = poll_interval_arg(std::env::args().nth(1).as_deref()) {
        config = config.with_poll_interval(interval);
    }

    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("Agent dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database:  {}", config.db_path.display());
    eprintln!("   Artifacts: {}", config.workspace_dir.display());
    eprintln!("   LLM:       {}", config.gateway.base_url);
    eprintln!("   Search:    {}", config.research.search_url);
    eprintln!(
        "   Poll:      every {}s\n",
        config.scheduler.poll_interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    provision_agents(&db, &config).await?;

    // ── Workspace ────────────────────────────────────────────────────────
    let workspace = Workspace::new(&config.workspace_dir);
    workspace
        .ensure_dirs()
        .await
        .context("Failed to create artifact workspace")?;

    // ── Pipeline + scheduler ─────────────────────────────────────────────
    let pipeline = PhasePipeline::new(PipelineDeps {
        store: db.clone(),
        gateway: create_gateway(&config.gateway),
        research: Arc::new(SearxClient::new(
            &config.research.search_url,
            config.research.fetch_timeout,
        )),
        workspace,
        renderer: Arc::new(BasicRenderer),
        config: config.pipeline.clone(),
    });
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        pipeline,
        config.scheduler.clone(),
    ));

    if config.scheduler.recover_on_startup {
        if let Err(e) = scheduler.recover_orphans().await {
            warn!(error = %e, "Startup recovery failed; the reclaimer will retry");
        }
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    spawn_scheduler_loop(scheduler, shutdown)
        .await
        .context("Scheduler loop panicked")?;

    info!("Shut down cleanly");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, plus a daily file when a log
/// directory is configured.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

/// Register agents listed in the environment that do not exist yet.
async fn provision_agents(db: &Arc<dyn Database>, config: &DispatchConfig) -> anyhow::Result<()> {
    for spec in &config.agents {
        if db.find_agent_by_name(&spec.name).await?.is_some() {
            continue;
        }
        let agent = Agent::new(
            &spec.name,
            &spec.model,
            spec.min_complexity,
            spec.max_complexity,
        );
        db.register_agent(&agent).await?;
    }

    let available = db.list_agents_by_status(AgentStatus::Available).await?.len();
    let busy = db.list_agents_by_status(AgentStatus::Busy).await?.len();
    if available + busy == 0 {
        warn!("No agents registered; set DISPATCH_AGENTS=name:model:min:max to add some");
    } else {
        info!(available, busy, "Agents ready");
    }
    Ok(())
}
