//! The two choking schedulers.
//!
//! Preferred neighbors are reselected on one timer, the optimistic slot
//! rotates on another, and both simply drive each link's `choke`/`unchoke`
//! transitions. The emit-only-on-change rule in [`crate::peer::PeerLink`] is
//! what lets the two timers overlap without double-choking anyone.

use std::{cmp::Reverse, sync::Arc};

use rand::{seq::SliceRandom, Rng};
use tokio::{sync::watch, time};

use crate::{swarm::Swarm, PeerId};

/// Reselects the preferred neighbors every unchoking interval until
/// shutdown.
pub(crate) async fn run_choke_scheduler(
    swarm: Arc<Swarm>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = time::interval(swarm.conf.unchoking_interval);
    // the first tick of an interval fires immediately
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => reselect_preferred(&swarm),
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Choke scheduler stopped");
}

/// Rotates the optimistic unchoke slot every optimistic interval until
/// shutdown.
pub(crate) async fn run_optimistic_scheduler(
    swarm: Arc<Swarm>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = time::interval(swarm.conf.optimistic_interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => rotate_optimistic(&swarm),
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Optimistic scheduler stopped");
}

/// One choke tick: rank the interested peers by what they delivered over the
/// closing interval, unchoke the winners (and the optimistic neighbor),
/// choke the rest, and open a fresh measurement window.
fn reselect_preferred(swarm: &Swarm) {
    let links = swarm.links();
    let interested: Vec<_> = links
        .iter()
        .filter(|link| link.is_peer_interested())
        .collect();

    if interested.is_empty() {
        // nothing to select, but the measurement window still advances
        for link in &links {
            link.reset_downloaded();
        }
        return;
    }

    let new_preferred = select_preferred(
        interested
            .iter()
            .map(|link| (link.id, link.downloaded()))
            .collect(),
        swarm.conf.preferred_count,
        swarm.store.is_complete(),
        &mut rand::thread_rng(),
    );

    let optimistic = swarm.optimistic();
    for link in &links {
        let should_unchoke =
            new_preferred.contains(&link.id) || optimistic == Some(link.id);
        if should_unchoke {
            link.unchoke();
        } else {
            link.choke();
        }
    }

    swarm.set_preferred(new_preferred.clone());
    for link in &links {
        link.reset_downloaded();
    }
    swarm.event_log.preferred_neighbors(&new_preferred);
}

/// Ranks the interested peers and returns the ids of the at most `count`
/// next preferred neighbors.
///
/// While we are still downloading, the peers that delivered the most bytes
/// over the closing interval win, ties broken uniformly at random. Once we
/// are a seed the rates carry no signal anymore, and the winners are drawn
/// uniformly at random so no leecher starves.
fn select_preferred(
    candidates: Vec<(PeerId, u64)>,
    count: usize,
    seeding: bool,
    rng: &mut impl Rng,
) -> Vec<PeerId> {
    let mut ranked: Vec<(Reverse<u64>, u64, PeerId)> = candidates
        .into_iter()
        .map(|(id, rate)| (Reverse(if seeding { 0 } else { rate }), rng.gen(), id))
        .collect();
    ranked.sort_unstable();
    ranked.into_iter().take(count).map(|(_, _, id)| id).collect()
}

/// One optimistic tick: draw a random choked-but-interested peer and move
/// the slot over to it.
fn rotate_optimistic(swarm: &Swarm) {
    let links = swarm.links();
    let preferred = swarm.preferred();
    let candidates: Vec<_> = links
        .iter()
        .filter(|link| {
            link.is_peer_choked()
                && link.is_peer_interested()
                && !preferred.contains(&link.id)
        })
        .collect();

    let Some(next) = candidates.choose(&mut rand::thread_rng()) else {
        swarm.set_optimistic(None);
        return;
    };
    let current = swarm.optimistic();
    if current == Some(next.id) {
        return;
    }

    if let Some(previous) = current {
        // the outgoing optimistic neighbor keeps its unchoke only if the
        // choke scheduler now counts it as preferred
        if !preferred.contains(&previous) {
            if let Some(link) = swarm.link(previous) {
                link.choke();
            }
        }
    }
    swarm.set_optimistic(Some(next.id));
    next.unchoke();
    swarm.event_log.optimistic_neighbor(next.id);
}
