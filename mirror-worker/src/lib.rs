pub mod commit;
pub mod config;
pub mod consumer;
pub mod membership;
pub mod producer;
pub mod prom;
pub mod pump;
pub mod topic_map;
pub mod transform;
pub mod worker;

use {
    futures::future::{BoxFuture, FutureExt},
    tokio::signal::unix::{signal, SignalKind},
    tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        layer::SubscriberExt,
        util::SubscriberInitExt,
    },
};

pub fn setup_tracing() -> anyhow::Result<()> {
    let is_atty = atty::is(atty::Stream::Stdout) && atty::is(atty::Stream::Stderr);
    let io_layer = tracing_subscriber::fmt::layer().with_ansi(is_atty);
    let level_layer = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(level_layer)
        .with(io_layer)
        .try_init()?;
    Ok(())
}

pub async fn create_shutdown() -> anyhow::Result<BoxFuture<'static, SignalKind>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => SignalKind::interrupt(),
            _ = sigterm.recv() => SignalKind::terminate(),
        }
    }
    .boxed())
}
