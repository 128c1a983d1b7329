use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadenza::adapter::HttpToolAdapter;
use cadenza::cli::{self, Cli, Command};
use cadenza::notify::ChannelSink;
use cadenza::state_machine::JobStatus;
use cadenza::ui::{self, JobProgress};
use cadenza::{CadenzaConfig, Orchestrator, ToolCatalog, ToolSelector};

/// Latency of simulated tools in `run --simulate`.
const SIMULATED_LATENCY: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CadenzaConfig::load_from(path)?,
        None => CadenzaConfig::load()?,
    };
    if let Some(n) = cli.max_concurrency {
        config.max_concurrent_calls = n;
    }
    init_tracing(&config, cli.verbose);

    let catalog = Arc::new(match &config.catalog_path {
        Some(path) => ToolCatalog::load(path)?,
        None => ToolCatalog::builtin(),
    });

    match cli.command {
        Command::Tools => ui::print_tools(&catalog),
        Command::Plan { file } => {
            let tasks = cli::load_tasks(&file)?;
            let plan = ToolSelector::new(catalog).plan(tasks)?;
            ui::print_plan(&plan);
        }
        Command::Run {
            request,
            file,
            workflow,
            simulate,
            user,
        } => {
            let workflow_config = cli::workflow_config(file.as_deref(), workflow.as_deref())?;
            run(config, catalog, &user, &request, workflow_config, simulate).await?;
        }
    }
    Ok(())
}

/// `RUST_LOG` wins, then `--verbose`, then the configured filter.
fn init_tracing(config: &CadenzaConfig, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.log_filter.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(
    config: CadenzaConfig,
    catalog: Arc<ToolCatalog>,
    user: &str,
    request: &str,
    workflow_config: serde_json::Map<String, serde_json::Value>,
    simulate: bool,
) -> Result<()> {
    let (sink, mut events) = ChannelSink::channel();
    let mut builder = Orchestrator::builder(config)
        .catalog(catalog.clone())
        .sink(Arc::new(sink));
    builder = if simulate {
        builder.simulate(SIMULATED_LATENCY)
    } else {
        builder.adapters(HttpToolAdapter::for_catalog(&catalog))
    };
    let orchestrator = builder.build();

    let job_id = orchestrator.create_job(user, request, workflow_config);
    let progress = JobProgress::start(&job_id);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    progress.update(&event);
                    if event.is_terminal() {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(job_id = %job_id, "interrupt received, cancelling");
                orchestrator.cancel_with_reason(&job_id, "interrupted");
            }
        }
    }

    let view = orchestrator.wait(&job_id).await?;
    progress.finish(&view);
    ui::print_report(&view);
    ui::print_usage(&orchestrator.usage());

    if view.status != JobStatus::Completed {
        bail!("job {job_id} ended as {}", view.status);
    }
    Ok(())
}
