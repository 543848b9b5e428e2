use std::time::Duration;

use anyhow::Context;
use gpu_uploads::upload::ManagerConfig;

use crate::engine::Engine;

mod engine;
mod frame;
mod messages;
mod producer;

const DEFAULT_SECONDS: u64 = 10;

#[cfg(feature = "tracing")]
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_tracy::TracyLayer::default())
        .try_init()
        .context("failed to install tracy subscriber")
}

fn main() -> anyhow::Result<()> {
    log4rs::init_file("log4rs.yml", Default::default())
        .context("failed to load logging config file")?;
    #[cfg(feature = "tracing")]
    init_tracing()?;

    let seconds = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("expected a duration in seconds, got `{arg}`"))?,
        None => DEFAULT_SECONDS,
    };

    let config = ManagerConfig::default()
        .max_creates_per_frame(32)
        .max_upload_bytes_per_frame(4 * 1024 * 1024)
        .batching(64 * 1024, 8 * 1024, 16);

    log::info!("soaking the upload manager for {}s", seconds);
    let mut engine = Engine::new(config).context("failed to start engine")?;
    std::thread::sleep(Duration::from_secs(seconds));
    engine.shutdown().context("failed to shut down engine")?;
    log::info!("soak finished");

    Ok(())
}
