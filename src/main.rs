use anyhow::Context;
use clap::Parser;

use swarmshare::{conf, engine::Engine, PeerId};

/// A peer process in a fixed-roster file distribution swarm.
///
/// Reads `Common.cfg` and `PeerInfo.cfg` from the working directory, then
/// exchanges pieces of the shared file with the other roster peers until
/// everyone holds the complete file.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// This peer's id, as listed in PeerInfo.cfg.
    peer_id: PeerId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let conf = conf::Conf::load("Common.cfg").context("failed to load Common.cfg")?;
    let roster =
        conf::load_roster("PeerInfo.cfg").context("failed to load PeerInfo.cfg")?;

    let engine = Engine::new(conf, roster, args.peer_id, ".")
        .await
        .context("failed to start peer engine")?;
    engine.run().await.context("peer engine failed")?;
    Ok(())
}
