//! The request driver.
//!
//! A single loop keeps one request in flight toward every neighbor that has
//! unchoked us and still holds pieces we lack. There is no per-request
//! timeout: a choke clears the in-flight slot, and the next sweep after the
//! following unchoke simply requests again.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time};

use crate::{peer::Message, swarm::Swarm};

/// The pacing delay between sweeps over the links.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) async fn run_request_driver(
    swarm: Arc<Swarm>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = time::sleep(SWEEP_INTERVAL) => sweep(&swarm),
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Request driver stopped");
}

/// One pass over the links: drop request slots that a choke (or our own
/// progress) invalidated, and fill the empty slots of unchoked, interesting
/// neighbors with a random wanted piece.
fn sweep(swarm: &Swarm) {
    let own_pieces = swarm.store.own_pieces();
    for link in swarm.links() {
        if link.is_choked() || !link.has_interesting_pieces(&own_pieces) {
            swarm.release_request(link.id);
            continue;
        }
        let candidates = link.interesting_pieces(&own_pieces);
        if let Some(piece_index) = swarm.reserve_request(link.id, &candidates) {
            log::trace!("Requesting piece {} from peer {}", piece_index, link.id);
            link.send(Message::Request { piece_index });
        }
    }
}
