use {
    clap::Parser,
    mirror_worker::{
        config::Config, create_shutdown, membership::StaticMembership, prom, setup_tracing,
        topic_map::TopicMap, transform::IdentityTransformer, worker::MirrorWorker,
    },
    std::{net::SocketAddr, sync::Arc},
    tracing::{error, warn},
};

#[derive(Debug, Parser)]
#[clap(author, version, about = "Mirror records between Kafka clusters")]
struct Args {
    /// Path to the worker config file
    #[clap(short, long)]
    config: String,

    /// Prometheus listen address, overrides the config file
    #[clap(long)]
    prometheus: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing()?;
    let args = Args::parse();
    let config = Config::load(&args.config).await?;

    if let Some(address) = args.prometheus.or(config.prometheus) {
        prom::run_server(address)?;
    }

    let topic_map = match &config.mirror.topic_mapping {
        Some(path) => TopicMap::load(path).await?,
        None => TopicMap::identity(),
    };
    let membership = Box::new(StaticMembership::from_config(&config.membership)?);
    let worker = Arc::new(MirrorWorker::new(
        &config,
        topic_map,
        Arc::new(IdentityTransformer),
        membership,
    )?);

    let shutdown = create_shutdown().await?;
    tokio::spawn({
        let worker = Arc::clone(&worker);
        async move {
            let signal = shutdown.await;
            warn!("{signal:?} received, shutting down");
            worker.initiate_shutdown();
        }
    });

    let runner = Arc::clone(&worker);
    if let Err(fatal) = tokio::task::spawn_blocking(move || runner.run()).await? {
        error!("{fatal:#}");
        std::process::exit(1);
    }
    Ok(())
}
