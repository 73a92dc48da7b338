use clap::Parser;
use lcm_rtc::{logger, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    logger::init(&config.log_filter);
    lcm_rtc::run(config).await
}
