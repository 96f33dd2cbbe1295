use std::sync::Arc;

use tracing::{error, info};

use s2s_exporter::config::{self, Config};
use s2s_exporter::irc::link::{self, Dialer, Link};
use s2s_exporter::irc::metrics::PrometheusSink;
use s2s_exporter::web;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let path = config::config_path(std::env::args().nth(1));
    info!("s2s-exporter {} starting, config {}", env!("CARGO_PKG_VERSION"), path.display());

    // Fail on a bad config or unreadable certificate before dialing anything.
    let config = Config::load(&path)?;
    let dialer = Dialer {
        addr: config.link.clone(),
        connector: config.connector()?,
        reconnect: config.reconnect,
    };

    let sink = PrometheusSink::new()?;
    let link = Link::new(config.identity(), Arc::new(sink.clone()), config.stats_interval());

    let web = tokio::spawn(web::serve(config.listen, sink));

    tokio::select! {
        result = link::run(&link, &dialer) => {
            if let Err(e) = result {
                error!("link lost: {e}");
                return Err(e.into());
            }
        }
        result = web => {
            // The endpoint only stops on a bind or accept failure.
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }

    Ok(())
}
