#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use zone_rpc::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.bridges.is_empty() {
        log::warn!(
            "No bridges are configured, the zone cannot reach or be reached by anyone :-)"
        );

        return Ok(());
    }

    zone_rpc::startup(config).await
}
