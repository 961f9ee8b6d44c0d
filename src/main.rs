use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use frontdoor::config::Settings;
use frontdoor::ports::directory::BackendDirectory;
use frontdoor::{
    AcmeObtainer, CertResolver, EdgeServer, ForwardingPipeline, GracefulShutdown,
    HyperBackendClient, PostgresDirectory,
};

#[tokio::main]
async fn main() -> Result<()> {
    frontdoor::tracing_setup::init_tracing()
        .map_err(|err| anyhow!("failed to initialize tracing: {err}"))?;

    // The TLS crypto provider is installed once, process-wide
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install default TLS crypto provider"))?;

    let settings = Settings::parse();
    tracing::info!(
        http_port = settings.http_port,
        https_port = settings.https_port,
        health_port = settings.health_port,
        "starting frontdoor"
    );

    let directory = Arc::new(
        PostgresDirectory::connect(&settings.database_url)
            .await
            .context("hostname directory is unreachable")?,
    );

    let allowed_hosts = directory
        .hostnames()
        .await
        .context("failed to enumerate hostnames for certificate issuance")?;
    tracing::info!(
        count = allowed_hosts.len(),
        "hostnames eligible for certificate issuance"
    );

    let obtainer = Arc::new(
        AcmeObtainer::new(settings.acme(), allowed_hosts)
            .context("failed to initialize certificate obtainer")?,
    );
    let resolver = Arc::new(
        CertResolver::new(obtainer.clone())
            .context("failed to generate the local self-signed certificate")?,
    );
    let client =
        Arc::new(HyperBackendClient::new().context("failed to build the backend HTTP client")?);
    let pipeline = Arc::new(ForwardingPipeline::new(directory.clone(), client));

    let shutdown = Arc::new(GracefulShutdown::new());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = shutdown.run_signal_handler().await {
                tracing::error!("signal handler error: {err:#}");
            }
        });
    }

    let server = EdgeServer::new(
        Arc::new(settings),
        pipeline,
        resolver,
        obtainer,
        shutdown,
    );
    server.run().await?;

    tracing::info!("server stopped");
    Ok(())
}
