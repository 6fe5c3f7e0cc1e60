use clap::Parser;

use fanmq::config::{load_config, Options};

#[derive(Parser, Debug)]
#[command(name = "fanmqd", about = "fanmq message broker daemon")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let opts = match &args.config {
        Some(path) => load_config(path)?,
        None => Options::default(),
    };

    let _log_guard = fanmq::logging::init_logging();
    fanmq::run(opts).await
}
