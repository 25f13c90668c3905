pub mod bridge;
pub mod config;

pub use codec;
pub use service;

use std::sync::Arc;
use std::time::Duration;

use codec::ids::Zone;
use service::{Service, ServiceOptions};

use self::config::{Bridge, Config};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "zone-rpc.",
    env!("CARGO_PKG_VERSION")
);

/// Starts the zone described by the configuration and keeps it running:
/// one service, plus a bridge endpoint per configured entry. Integration
/// tests call this instead of the binary's main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let service = Service::new(ServiceOptions::new(
        Zone::new(config.zone.id),
        format!("{}/{}", SOFTWARE, config.zone.name),
    ));

    for entry in &config.bridges {
        match entry {
            Bridge::Listen { .. } => {
                tokio::spawn(bridge::listen(service.clone(), entry.clone()));
            }
            Bridge::Connect {
                connect,
                destination_zone,
                timeout,
            } => {
                bridge::connect(
                    &service,
                    *connect,
                    Zone::new(*destination_zone),
                    Duration::from_secs(*timeout),
                )
                .await?;
            }
        }
    }

    // The zone is non-blocking once its bridges are up; keep the
    // process alive for as long as the operator wants the zone.
    std::future::pending::<()>().await;
    Ok(())
}
