//! Process-wide swarm state.
//!
//! A single [`Swarm`] value is shared by every component of the engine. Each
//! field carries its own synchronization: the link registry sees rare writes
//! (connection setup and teardown) and frequent reads, the request table is a
//! plain mutex, and the choking state is only touched by the schedulers.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;

use crate::{
    conf::Conf,
    error::*,
    eventlog::EventLog,
    peer::{Message, PeerLink},
    storage::PieceStore,
    PeerId, PieceIndex,
};

pub(crate) struct Swarm {
    pub conf: Conf,
    /// Our own id.
    pub own_id: PeerId,
    /// The ids of every roster peer, our own included.
    roster: HashSet<PeerId>,
    pub store: PieceStore,
    pub event_log: EventLog,
    /// The live connections, keyed by remote id.
    links: RwLock<HashMap<PeerId, Arc<PeerLink>>>,
    /// The piece currently requested from each peer. At most one request is
    /// in flight per peer, and the values double as a best-effort hint not
    /// to request the same piece from two peers at once.
    outstanding_requests: Mutex<HashMap<PeerId, PieceIndex>>,
    /// The remote ids selected at the last choke tick.
    preferred: Mutex<Vec<PeerId>>,
    /// The currently optimistically unchoked neighbor, if any.
    optimistic: Mutex<Option<PeerId>>,
    /// Roster peers that have been seen with a full bitfield. Sticky, so a
    /// peer that completes and disconnects still counts as complete.
    completed_peers: Mutex<HashSet<PeerId>>,
    /// Whether the local completion event has been written already.
    completion_logged: AtomicBool,
}

impl Swarm {
    pub fn new(
        conf: Conf,
        own_id: PeerId,
        roster: HashSet<PeerId>,
        store: PieceStore,
        event_log: EventLog,
    ) -> Self {
        // a peer that starts out as a seed is complete from the first moment
        let complete = store.is_complete();
        if complete {
            event_log.download_complete();
        }
        Self {
            conf,
            own_id,
            roster,
            store,
            event_log,
            links: RwLock::new(HashMap::new()),
            outstanding_requests: Mutex::new(HashMap::new()),
            preferred: Mutex::new(Vec::new()),
            optimistic: Mutex::new(None),
            completed_peers: Mutex::new(HashSet::new()),
            completion_logged: AtomicBool::new(complete),
        }
    }

    pub fn in_roster(&self, id: PeerId) -> bool {
        self.roster.contains(&id)
    }

    pub fn insert_link(&self, link: Arc<PeerLink>) -> Result<()> {
        let mut links = self.links.write();
        if links.contains_key(&link.id) {
            return Err(Error::AlreadyConnected(link.id));
        }
        links.insert(link.id, link);
        Ok(())
    }

    /// Removes a departed peer's link and whatever request was in flight
    /// toward it.
    pub fn remove_link(&self, id: PeerId) {
        self.links.write().remove(&id);
        self.release_request(id);
    }

    /// A snapshot of the live links.
    pub fn links(&self) -> Vec<Arc<PeerLink>> {
        self.links.read().values().cloned().collect()
    }

    pub fn link(&self, id: PeerId) -> Option<Arc<PeerLink>> {
        self.links.read().get(&id).cloned()
    }

    /// Forgets the in-flight request toward the given peer, either because a
    /// piece arrived or because a choke invalidated it.
    pub fn release_request(&self, peer: PeerId) {
        self.outstanding_requests.lock().remove(&peer);
    }

    /// Picks one of the candidate pieces uniformly at random and records it
    /// as the peer's in-flight request. Candidates already requested from
    /// some other peer are passed over.
    ///
    /// Returns `None` when a request is already in flight toward the peer or
    /// no candidate survives the dedup filter.
    pub fn reserve_request(
        &self,
        peer: PeerId,
        candidates: &[PieceIndex],
    ) -> Option<PieceIndex> {
        let mut outstanding = self.outstanding_requests.lock();
        if outstanding.contains_key(&peer) {
            return None;
        }
        let free: Vec<PieceIndex> = candidates
            .iter()
            .copied()
            .filter(|index| !outstanding.values().any(|requested| requested == index))
            .collect();
        let pick = *free.choose(&mut rand::thread_rng())?;
        outstanding.insert(peer, pick);
        Some(pick)
    }

    pub fn preferred(&self) -> Vec<PeerId> {
        self.preferred.lock().clone()
    }

    pub fn set_preferred(&self, ids: Vec<PeerId>) {
        *self.preferred.lock() = ids;
    }

    pub fn optimistic(&self) -> Option<PeerId> {
        *self.optimistic.lock()
    }

    pub fn set_optimistic(&self, id: Option<PeerId>) {
        *self.optimistic.lock() = id;
    }

    /// Records that a roster peer has been seen with a full bitfield.
    pub fn mark_peer_complete(&self, id: PeerId) {
        self.completed_peers.lock().insert(id);
    }

    /// Whether every other roster peer has been seen with a full bitfield.
    pub fn all_peers_complete(&self) -> bool {
        let completed = self.completed_peers.lock();
        self.roster
            .iter()
            .all(|id| *id == self.own_id || completed.contains(id))
    }

    /// Ingests a piece received from the given peer: persist it, announce it
    /// to everyone else, and recompute interest on every link now that the
    /// local bitfield grew.
    pub async fn ingest_piece(
        &self,
        from: &PeerLink,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        if self.store.has_piece(index) {
            // a lost request race; the duplicate is discarded
            log::debug!("Discarding duplicate piece {} from peer {}", index, from.id);
            return Ok(());
        }
        if !self.store.write_piece(index, data).await? {
            return Ok(());
        }

        self.event_log
            .piece_downloaded(index, from.id, self.store.piece_count());

        // the announcement goes to every neighbor, the sender included:
        // completion detection relies on each peer watching every other
        // peer's bitfield fill up, and the sender's view of ours only grows
        // through HAVE messages like anyone else's
        let own_pieces = self.store.own_pieces();
        for link in self.links() {
            link.send(Message::Have { piece_index: index });
            link.update_interest(&own_pieces);
        }

        if self.store.is_complete() && !self.completion_logged.swap(true, Ordering::SeqCst)
        {
            log::info!("Download complete");
            self.event_log.download_complete();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::conf::StorageInfo;
    use crate::peer::Command;

    fn test_swarm(dir: &std::path::Path, roster: &[PeerId]) -> Swarm {
        let conf = Conf {
            preferred_count: 2,
            unchoking_interval: std::time::Duration::from_secs(5),
            optimistic_interval: std::time::Duration::from_secs(15),
            file_name: "TheFile.dat".to_string(),
            file_size: 1000,
            piece_size: 100,
        };
        let store = PieceStore::open_empty(
            dir.join(&conf.file_name),
            StorageInfo::new(conf.file_size, conf.piece_size),
        )
        .unwrap();
        let event_log = EventLog::create(dir, 1001).unwrap();
        Swarm::new(conf, 1001, roster.iter().copied().collect(), store, event_log)
    }

    fn test_link(id: PeerId) -> (Arc<PeerLink>, mpsc::UnboundedReceiver<Command>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (Arc::new(PeerLink::new(id, 10, cmd_chan)), cmd_port)
    }

    #[test]
    fn test_link_registry() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = test_swarm(dir.path(), &[1001, 1002]);
        let (link, _cmd_port) = test_link(1002);

        swarm.insert_link(Arc::clone(&link)).unwrap();
        assert!(matches!(
            swarm.insert_link(link),
            Err(Error::AlreadyConnected(1002))
        ));
        assert_eq!(swarm.links().len(), 1);
        assert!(swarm.link(1002).is_some());

        swarm.remove_link(1002);
        assert!(swarm.link(1002).is_none());
    }

    #[test]
    fn test_reserve_request_is_single_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = test_swarm(dir.path(), &[1001, 1002]);

        let pick = swarm.reserve_request(1002, &[3, 5, 7]).unwrap();
        assert!([3, 5, 7].contains(&pick));
        // a second reservation is refused until the first resolves
        assert_eq!(swarm.reserve_request(1002, &[3, 5, 7]), None);

        swarm.release_request(1002);
        assert!(swarm.reserve_request(1002, &[4]).is_some());
    }

    #[test]
    fn test_reserve_request_dedups_across_peers() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = test_swarm(dir.path(), &[1001, 1002, 1003]);

        assert_eq!(swarm.reserve_request(1002, &[5]), Some(5));
        // peer 1003 only has piece 5 to offer, which is already in flight
        assert_eq!(swarm.reserve_request(1003, &[5]), None);
        assert_eq!(swarm.reserve_request(1003, &[5, 6]), Some(6));
    }

    #[test]
    fn test_all_peers_complete_ignores_own_id() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = test_swarm(dir.path(), &[1001, 1002, 1003]);

        assert!(!swarm.all_peers_complete());
        swarm.mark_peer_complete(1002);
        assert!(!swarm.all_peers_complete());
        swarm.mark_peer_complete(1003);
        assert!(swarm.all_peers_complete());
    }

    fn drained(port: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Ok(Command::Send(msg)) = port.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    #[tokio::test]
    async fn test_ingest_piece_announces_to_every_link() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = test_swarm(dir.path(), &[1001, 1002, 1003]);
        let (sender, mut sender_port) = test_link(1002);
        let (other, mut other_port) = test_link(1003);
        swarm.insert_link(Arc::clone(&sender)).unwrap();
        swarm.insert_link(Arc::clone(&other)).unwrap();
        // the other peer holds pieces we lack, so the announcement also
        // updates interest toward it
        other.set_have(2).unwrap();

        swarm.ingest_piece(&sender, 2, vec![9; 100]).await.unwrap();

        assert!(swarm.store.has_piece(2));
        // every neighbor hears the announcement, the sender included: its
        // view of our bitfield grows through HAVE messages like anyone
        // else's
        assert_eq!(
            drained(&mut sender_port),
            vec![Message::Have { piece_index: 2 }]
        );
        assert_eq!(
            drained(&mut other_port),
            vec![Message::Have { piece_index: 2 }]
        );

        // a duplicate delivery is discarded without another announcement
        swarm.ingest_piece(&sender, 2, vec![9; 100]).await.unwrap();
        assert!(other_port.try_recv().is_err());
    }
}
