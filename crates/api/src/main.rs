use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Notify;
use tokio::time::Instant;

use companies_api::app::{build_app, services};
use companies_api::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse_args();
    config.validate().context("invalid configuration")?;
    companies_observability::init(&config.log_level)?;

    let services = services::build_services(&config)
        .await
        .context("failed to initialize services")?;
    let pipelines = services.companies.clone();
    let app = build_app(services);

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let signalled = Arc::new(Notify::new());
    let server = {
        let signalled = signalled.clone();
        axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown_signal().await;
            signalled.notify_one();
        })
    };
    let mut server = tokio::spawn(async move { server.await });

    let grace = config.shutdown_grace();
    let deadline = tokio::select! {
        res = &mut server => {
            res??;
            Instant::now() + grace
        }
        _ = signalled.notified() => {
            let deadline = Instant::now() + grace;
            tracing::info!(grace_secs = grace.as_secs(), "shutdown signal received, draining requests");
            match tokio::time::timeout_at(deadline, &mut server).await {
                Ok(res) => res??,
                Err(_) => {
                    tracing::warn!("grace period elapsed with requests still in flight");
                    server.abort();
                }
            }
            deadline
        }
    };

    // Mutations whose caller already got an answer may still be emitting.
    match tokio::time::timeout_at(deadline, pipelines.drain()).await {
        Ok(0) => {}
        Ok(finished) => tracing::info!(finished, "in-flight mutations completed"),
        Err(_) => tracing::warn!("grace period elapsed with mutations still emitting"),
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
