use anyhow::Result;
use clap::Parser;

use caching_proxy::{clear_cache, cli::Cli, logging, run, settings::Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    logging::init_logger(settings.log, settings.log_level)?;
    if cli.clear_cache {
        let removed = clear_cache(&settings).await?;
        println!("cache cleared: {removed} entries removed");
        return Ok(());
    }
    run(settings).await
}
