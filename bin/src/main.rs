#![allow(clippy::cognitive_complexity)]
use anyhow::{Context, Result, anyhow};
use consul_coordination::{CoordinationContext, Document, DocumentKind, Members};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_futures::Instrument;

mod config;

use crate::config::{
    cli::{self, Parser},
    trace,
};

fn main() -> Result<()> {
    // loaded first so its vars are visible to the cli env fallback
    let dotenv = dotenv::dotenv();
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.watch_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start watcher"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    debug!("loading coordination config");
    let coordination = config.load()?;
    let ctx = CoordinationContext::from_config(&coordination)
        .context("invalid coordination settings")?;
    info!(
        service_name = ctx.service_name(),
        service_id = ctx.service_id(),
        consul = %ctx.consul().base_url(),
        "starting consul-watch"
    );

    // permanent failures (bad token, unreachable agent) stop startup here
    ctx.verify()
        .await
        .map_err(|err| anyhow!("consul startup check failed: {err}"))?;

    let token = CancellationToken::new();
    let config_task = spawn_follower(
        DocumentKind::Config,
        ctx.watch_config()?,
        token.clone(),
    );
    let control_task = spawn_follower(
        DocumentKind::Control,
        ctx.watch_control()?,
        token.clone(),
    );
    let health_task = spawn_members_follower(
        ctx.watch_service_health(ctx.health_quiet_period())?,
        token.clone(),
    );

    shutdown_signal(token.clone()).await?;
    info!("shutdown requested");
    ctx.shutdown().await;

    for (name, task) in [
        ("config", config_task),
        ("control", control_task),
        ("health", health_task),
    ] {
        if let Err(err) = task.await {
            error!(?err, follower = name, "error waiting for follower task");
        }
    }
    Ok(())
}

/// Log every change of one coordination document.
fn spawn_follower<S>(kind: DocumentKind, mut stream: S, token: CancellationToken) -> JoinHandle<()>
where
    S: Stream<Item = Document> + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("follower stopping");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Some(value)) => info!(bytes = value.len(), %value, "document changed"),
                        Some(None) => info!("document absent"),
                        None => {
                            debug!("watch closed");
                            return;
                        }
                    }
                }
            }
        }
        .instrument(info_span!("follow", document = %kind)),
    )
}

/// Log every settled membership of the service.
fn spawn_members_follower<S>(mut stream: S, token: CancellationToken) -> JoinHandle<()>
where
    S: Stream<Item = Members> + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("follower stopping");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(members) => info!(count = members.len(), ?members, "healthy members settled"),
                        None => {
                            debug!("watch closed");
                            return;
                        }
                    }
                }
            }
        }
        .instrument(info_span!("follow", document = "health")),
    )
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
