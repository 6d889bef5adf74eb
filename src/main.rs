use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use kru::cloud::CloudResourceClient;
use kru::cloud::az::AzCliClient;
use kru::config::{Args, BUILD_DATE, COMMIT, Config, LogFormat, VERSION};
use kru::k8s::client::build_kube_client;
use kru::k8s::scheduler::KubeNodeScheduler;
use kru::model::store;
use kru::notify::{self, SlackNotifier};
use kru::upgrade::Orchestrator;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid arguments: {e}");
            std::process::exit(2);
        }
    };

    // Initialize logging
    if let Err(e) = init_tracing(&config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting kru v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run(&config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    match format {
        LogFormat::Json => fmt().with_env_filter(filter).json().with_target(true).init(),
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init(),
    }

    Ok(())
}

async fn run(config: &Config) -> Result<()> {
    let (mut model, api_version) =
        store::load(&config.api_model).context("loading existing cluster")?;
    let cluster = model.name_suffix().to_string();
    let run_config = config.run_config(&model);

    let cloud: Arc<dyn CloudResourceClient> =
        Arc::new(AzCliClient::new(config.subscription.clone()));
    let kube_client = build_kube_client(config.kubeconfig.as_deref()).await?;
    let scheduler = Arc::new(KubeNodeScheduler::new(kube_client));

    let orchestrator = Orchestrator::new(run_config, Arc::clone(&cloud), scheduler);
    orchestrator
        .preflight(&mut model)
        .context("validating upgrade command")?;

    if config.dry_run {
        let report = orchestrator
            .upgrade_cluster(&mut model)
            .await
            .context("planning upgrade")?;
        let plan = serde_yaml::to_string(&report.plan).context("Failed to render plan")?;
        println!("{plan}");
        return Ok(());
    }

    cloud
        .ensure_resource_group(&config.resource_group, model.location())
        .await
        .context("ensuring resource group")?;

    let slack = config.slack_webhook_url.clone().map(|url| {
        info!("Slack notifications enabled");
        SlackNotifier::new(url)
    });

    let from_version = model.orchestrator_version().to_string();
    let started_at = chrono::Utc::now();
    if let Some(slack) = &slack {
        let msg = notify::build_started_message(&cluster, orchestrator.config(), &from_version);
        slack.send(&cluster, &msg).await;
    }

    let result = orchestrator.upgrade_cluster(&mut model).await;

    // Progress made before a failure is kept so a rerun picks up where this one stopped.
    let touched = result.as_ref().err().is_none_or(|e| !e.is_fatal_for_run());
    if touched
        && let Err(e) = store::save(&config.api_model, &model, &api_version)
    {
        warn!("Failed to save api model: {:#}", e);
        if result.is_ok() {
            return Err(e).context("saving api model");
        }
    }

    match result {
        Ok(report) => {
            info!(
                "Upgrade finished in {} minutes",
                report.duration_minutes()
            );
            if let Some(slack) = &slack {
                let msg = notify::build_completed_message(&cluster, orchestrator.config(), &report);
                slack.send(&cluster, &msg).await;
            }
            Ok(())
        }
        Err(e) => {
            if e.is_retryable() {
                warn!("Rerunning the same command resumes with the nodes not yet upgraded");
            }
            if let Some(slack) = &slack {
                let msg =
                    notify::build_failed_message(&cluster, orchestrator.config(), started_at, &e);
                slack.send(&cluster, &msg).await;
            }
            Err(e).context("upgrading cluster")
        }
    }
}
