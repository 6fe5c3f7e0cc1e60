pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod util;

use crate::broker::Broker;
use crate::config::Options;

/// Boot the broker and run until interrupted.
pub async fn run(opts: Options) -> anyhow::Result<()> {
    let broker = Broker::new(opts)?;
    broker.load_metadata()?;
    broker.start();

    tokio::signal::ctrl_c().await?;
    broker.exit().await;
    Ok(())
}
