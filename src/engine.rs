//! The lifecycle controller: startup, connection management, completion
//! monitoring, and shutdown.

use std::{collections::HashSet, fs, path::PathBuf, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::watch, time};

use crate::{
    choker,
    conf::{Conf, PeerInfo},
    error::*,
    eventlog::EventLog,
    peer, request,
    storage::PieceStore,
    swarm::Swarm,
    PeerId,
};

/// How often the completion monitor re-evaluates the swarm's state.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// One peer's engine. Owns the listening endpoint and the shared swarm
/// state; everything else runs as spawned tasks.
pub struct Engine {
    swarm: Arc<Swarm>,
    roster: Vec<PeerInfo>,
    own: PeerInfo,
    listener: TcpListener,
}

impl Engine {
    /// Prepares the peer for its run: locates our roster record, opens the
    /// piece store (seeds must already have the file, everyone else gets a
    /// preallocated empty one), creates the event log, and binds the
    /// listening endpoint.
    ///
    /// `working_dir` is where the configuration prescribes everything to
    /// live: the event log, and a subdirectory per peer id holding the
    /// shared file.
    pub async fn new(
        conf: Conf,
        roster: Vec<PeerInfo>,
        own_id: PeerId,
        working_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let own = roster
            .iter()
            .find(|peer| peer.id == own_id)
            .cloned()
            .ok_or(Error::UnknownPeer(own_id))?;

        let working_dir = working_dir.into();
        let dir = working_dir.join(own_id.to_string());
        fs::create_dir_all(&dir)?;
        let file_path = dir.join(&conf.file_name);
        let info = conf.storage_info();
        let store = if own.has_file {
            PieceStore::open_seed(&file_path, info)?
        } else {
            PieceStore::open_empty(&file_path, info)?
        };

        let event_log = EventLog::create(&working_dir, own_id)?;
        let listener = TcpListener::bind(("0.0.0.0", own.port)).await?;
        log::info!("Peer {} listening on port {}", own_id, own.port);

        let roster_ids: HashSet<PeerId> = roster.iter().map(|peer| peer.id).collect();
        let swarm = Arc::new(Swarm::new(conf, own_id, roster_ids, store, event_log));

        Ok(Self {
            swarm,
            roster,
            own,
            listener,
        })
    }

    /// Runs the engine until every roster peer, ourselves included, holds
    /// the complete file.
    pub async fn run(self) -> Result<()> {
        let (shutdown_chan, shutdown_port) = watch::channel(false);

        // dial every peer with a strictly lower id, in roster order; peers
        // not yet up will dial us once they start
        for peer in self.roster.iter().filter(|peer| peer.id < self.own.id) {
            let swarm = Arc::clone(&self.swarm);
            let peer = peer.clone();
            tokio::spawn(async move {
                let id = peer.id;
                if let Err(e) = peer::run_outbound(swarm, peer).await {
                    log::warn!("Outbound session with peer {} ended: {}", id, e);
                }
            });
        }

        let schedulers = [
            tokio::spawn(choker::run_choke_scheduler(
                Arc::clone(&self.swarm),
                shutdown_port.clone(),
            )),
            tokio::spawn(choker::run_optimistic_scheduler(
                Arc::clone(&self.swarm),
                shutdown_port.clone(),
            )),
            tokio::spawn(request::run_request_driver(
                Arc::clone(&self.swarm),
                shutdown_port,
            )),
        ];
        let mut monitor = tokio::spawn(completion_monitor(Arc::clone(&self.swarm)));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        log::debug!("Accepted connection from {}", addr);
                        let swarm = Arc::clone(&self.swarm);
                        tokio::spawn(async move {
                            if let Err(e) = peer::run_inbound(swarm, socket).await {
                                log::warn!("Inbound session from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => log::warn!("Failed to accept connection: {}", e),
                },
                _ = &mut monitor => break,
            }
        }

        // every roster peer has everything: stop accepting, wind down the
        // periodic tasks, and close the links
        log::info!("All peers complete, shutting down");
        drop(self.listener);
        let _ = shutdown_chan.send(true);
        for link in self.swarm.links() {
            link.shutdown();
        }
        for scheduler in schedulers {
            let _ = scheduler.await;
        }
        Ok(())
    }
}

/// Completes once the local file is complete and every other roster peer has
/// been seen with a full bitfield.
async fn completion_monitor(swarm: Arc<Swarm>) {
    loop {
        time::sleep(MONITOR_INTERVAL).await;
        if swarm.store.is_complete() && swarm.all_peers_complete() {
            return;
        }
    }
}
