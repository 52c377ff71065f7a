use anyhow::Result;
use vlbimon_bridge::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    vlbimon_bridge::init_tracing()?;
    vlbimon_bridge::bridge::run(config).await
}
