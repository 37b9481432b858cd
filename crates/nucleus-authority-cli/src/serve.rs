//! Serve command - run the authority until interrupted
//!
//! Bootstraps the local CAs, prints the host CA pins and runs the auto
//! rotation loop. Ctrl-C stops the loop after the current check.

use anyhow::{Context, Result};
use clap::Args;
use nucleus_authority::{
    AuthService, BuiltinRole, Caller, CertAuthId, CertAuthType, MemoryBackend, SystemClock,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Bootstrap the cluster CAs and run until interrupted
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Fail certificate requests that take longer than this many seconds
    #[arg(long, default_value_t = 30)]
    pub request_deadline_secs: u64,
}

pub async fn execute(args: ServeArgs, config_path: &Path) -> Result<()> {
    let config = crate::config::load(config_path)?;
    let cluster = config.cluster_name.clone();

    let service = AuthService::new(Arc::new(MemoryBackend::new()), Arc::new(SystemClock), config)
        .with_request_deadline(Duration::from_secs(args.request_deadline_secs));
    service.bootstrap().await.context("failed to bootstrap cert authorities")?;

    let admin = Caller::builtin(BuiltinRole::Admin, "nucleus-authority", &cluster);
    let host_ca = service
        .get_cert_authority(admin, &CertAuthId::new(&cluster, CertAuthType::Host), false)
        .await?;
    for pin in host_ca.pins() {
        info!(cluster = %cluster, pin = %pin, "host CA pin");
    }

    let rotation = service.rotation().clone();
    let handle = tokio::spawn(rotation.clone().run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    rotation.shutdown();
    handle.await.context("rotation loop panicked")?;
    Ok(())
}
