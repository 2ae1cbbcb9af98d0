use std::process::ExitCode;

use psbench::controller::{ControllerConfig, Error, KubeInventory, Reconciler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "bpf")]
async fn run(config: ControllerConfig, inventory: KubeInventory) -> Result<(), Error> {
    use psbench::controller::fanout::pinned::PinnedMaps;

    let maps = PinnedMaps::open(&config.pin_root)?;
    let cfg = maps.config()?;
    info!(
        root = %maps.root().display(),
        egress_ifindex = cfg.egress_ifindex,
        local_route_ifindex = cfg.local_route_ifindex,
        local_node_id = cfg.local_node_id,
        "attached to forwarder maps"
    );
    Reconciler::new(inventory, maps, config).run().await?;
    Ok(())
}

#[cfg(not(feature = "bpf"))]
async fn run(config: ControllerConfig, inventory: KubeInventory) -> Result<(), Error> {
    use psbench::controller::GenerationBuffer;

    tracing::warn!("built without bpf support, tables are kept in memory only");
    Reconciler::new(inventory, GenerationBuffer::new(), config)
        .run()
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let result = async {
        let config = ControllerConfig::from_env()?;
        info!(?config, "starting fanout controller");
        let inventory = KubeInventory::in_cluster(&config)?;
        run(config, inventory).await
    }
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fanout controller exiting");
            ExitCode::FAILURE
        }
    }
}
