//! aws-asg-roller - rolling updates for AWS auto-scaling groups

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aws_asg_roller::cloud::AwsGroupProvider;
use aws_asg_roller::config::Config;
use aws_asg_roller::readiness::{KubernetesReadiness, ReadinessProvider};
use aws_asg_roller::roller::{Roller, RollerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let config = Config::parse();

    // Initialize tracing; RUST_LOG still wins over the verbose flag
    let default_filter = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let group_names = config.group_names()?;
    let interval = config.effective_interval()?;

    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let cloud = Arc::new(AwsGroupProvider::new(&aws));

    // In-cluster config wins; out of cluster the local kubeconfig is used
    let readiness: Option<Arc<dyn ReadinessProvider>> = if config.kubernetes {
        let client = Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
        Some(Arc::new(KubernetesReadiness::new(
            client,
            config.ignore_daemonsets,
            config.delete_local_data,
        )))
    } else {
        tracing::info!("Kubernetes integration disabled");
        None
    };

    tracing::info!(
        groups = %group_names.join(","),
        interval = ?interval,
        kubernetes = readiness.is_some(),
        "aws-asg-roller starting..."
    );

    let mut roller = Roller::new(cloud, readiness, RollerOptions::from(&config));
    roller.run(&group_names, interval).await;

    tracing::info!("aws-asg-roller stopped");
    Ok(())
}
