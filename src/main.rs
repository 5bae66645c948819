use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::Registry;
use prooftail::{cli, exporter, PrometheusSink, TailFollower};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let matches = cli::command().get_matches();
    let settings = cli::settings_from_matches(&matches)?;

    let registry = Registry::new();
    let sink = Arc::new(
        PrometheusSink::register(&registry).context("failed to register proof rate metrics")?,
    );

    let (follower, feed) = TailFollower::open(&settings.log_path, sink, settings.follower_config())
        .inspect_err(|err| error!(error = %err, "cannot start tailing"))?;

    let metrics_addr = settings.listen_addr;
    let metrics = tokio::spawn(async move {
        if let Err(err) = exporter::serve(metrics_addr, registry).await {
            error!(addr = %metrics_addr, error = %err, "metrics endpoint failed");
        }
    });

    let mut worker = tokio::task::spawn_blocking(move || follower.run());

    let outcome = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            feed.shutdown();
            worker.await
        }
    };
    metrics.abort();

    outcome
        .context("tailing worker panicked")?
        .inspect_err(|err| error!(error = %err, "tailing stopped"))?;
    info!("tailing finished");
    Ok(())
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
