//! Bridge operator.
//!
//! Deploys the bridge covenant, then drives deposits into it and withdrawals out of it as blocks
//! and L2 events arrive.

mod args;
mod bootstrap;
mod constants;
mod events;
mod keys;

use args::Cli;
use catbridge_common::logging;
use catbridge_exec::config::Config;
use tracing::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Cli = argh::from_env();
    init_logging();

    let config = Config::load_from_path(&args.config)?;
    info!(network = %config.network, "starting bridge operator");

    let result = bootstrap::bootstrap(args, config).await;
    if let Err(err) = &result {
        error!(%err, "operator exited with error");
    }

    logging::finalize();
    result
}

fn init_logging() {
    let mut lconfig = logging::LoggerConfig::with_base_name("catbridge-operator");
    if let Some(url) = logging::get_otlp_url_from_env() {
        lconfig.set_otlp_url(url);
    }
    logging::init(lconfig);
}
