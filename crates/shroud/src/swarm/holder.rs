use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::time::sleep;
use tracing::debug;

use crate::{
    error::Error,
    torrent::{EventHook, InfoHash, Torrent, TorrentEvent},
    utils::lock,
};

/// Registry of the torrents of a swarm, by info hash and by id.
pub struct Holder {
    torrents: Mutex<HashMap<InfoHash, Arc<Torrent>>>,
    by_id: Mutex<HashMap<u64, InfoHash>>,
    next_id: AtomicU64,
    /// Torrents started and not stopped.
    active: AtomicUsize,
    /// Maximum number of active torrents, 0 for no limit.
    queue_size: AtomicUsize,
}

impl Holder {
    pub fn new(queue_size: usize) -> Self {
        Self {
            torrents: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            queue_size: AtomicUsize::new(queue_size),
        }
    }

    /// Id for the next torrent.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, torrent: Arc<Torrent>) -> Result<(), Error> {
        let info_hash = torrent.info_hash();
        let mut torrents = lock(&self.torrents);
        if torrents.contains_key(&info_hash) {
            return Err(Error::NoDuplicateTorrent(info_hash));
        }
        lock(&self.by_id).insert(torrent.id, info_hash.clone());
        torrents.insert(info_hash, torrent);
        Ok(())
    }

    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        lock(&self.torrents).contains_key(info_hash)
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<Torrent>> {
        lock(&self.torrents).get(info_hash).cloned()
    }

    pub fn get_by_id(&self, id: u64) -> Option<Arc<Torrent>> {
        let info_hash = lock(&self.by_id).get(&id).cloned()?;
        self.get(&info_hash)
    }

    /// Ids of every torrent, sorted.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.by_id).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn remove(&self, info_hash: &InfoHash) -> Option<Arc<Torrent>> {
        let torrent = lock(&self.torrents).remove(info_hash)?;
        lock(&self.by_id).remove(&torrent.id);
        debug!("{info_hash:?} removed");
        Some(torrent)
    }

    /// Every torrent, ordered by id.
    pub fn torrents(&self) -> Vec<Arc<Torrent>> {
        let mut torrents: Vec<_> = lock(&self.torrents).values().cloned().collect();
        torrents.sort_by_key(|t| t.id);
        torrents
    }

    pub fn len(&self) -> usize {
        lock(&self.torrents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_queue_size(&self, n: usize) {
        self.queue_size.store(n, Ordering::Relaxed);
    }

    /// Take an active slot, waiting while the queue is full.
    pub async fn wait_for_slot(&self) {
        loop {
            let limit = self.queue_size.load(Ordering::Relaxed);
            let active = self.active.load(Ordering::Acquire);
            if limit == 0 || active < limit {
                let taken = self
                    .active
                    .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if taken {
                    return;
                }
                continue;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Give back a slot taken by [`Holder::wait_for_slot`].
    pub fn release_slot(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// The hook handed to torrents, it only holds a weak reference.
    pub fn hook(self: &Arc<Self>) -> EventHook {
        let holder = Arc::downgrade(self);
        Arc::new(move |info_hash: &InfoHash, event: TorrentEvent| {
            let Some(holder) = holder.upgrade() else { return };
            match event {
                TorrentEvent::Stopped => holder.release_slot(),
                TorrentEvent::Removed => {
                    holder.remove(info_hash);
                }
            }
        })
    }

    /// Stop every torrent and wait for all of them. Without `announce` the
    /// trackers are not told.
    pub async fn close(&self, announce: bool) {
        let torrents = self.torrents();
        join_all(torrents.iter().map(|t| async move {
            if announce {
                if let Err(e) = t.stop().await {
                    debug!("{:?} {e}", t.info_hash());
                }
            } else {
                t.close();
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::*;
    use crate::{
        config::Config,
        storage::MemoryTorrent,
        torrent::TorrentParams,
    };

    fn torrent(holder: &Arc<Holder>, hash: u8) -> Arc<Torrent> {
        let (_tx, network) = watch::channel(None);
        Torrent::new(TorrentParams {
            id: holder.next_id(),
            storage: Arc::new(MemoryTorrent::empty(InfoHash([hash; 20]), "t")),
            network,
            config: Config::default(),
            dht: None,
            hook: Some(holder.hook()),
        })
    }

    #[tokio::test]
    async fn index_by_hash_and_id() {
        let holder = Arc::new(Holder::new(0));
        let a = torrent(&holder, 1);
        let b = torrent(&holder, 2);

        holder.insert(a.clone()).unwrap();
        holder.insert(b.clone()).unwrap();
        assert!(matches!(
            holder.insert(torrent(&holder, 1)),
            Err(Error::NoDuplicateTorrent(_))
        ));

        assert_eq!(holder.ids(), vec![a.id, b.id]);
        assert_eq!(holder.get_by_id(b.id).map(|t| t.info_hash()), Some(b.info_hash()));

        a.remove().await.unwrap();
        assert!(holder.get(&a.info_hash()).is_none());
        assert!(holder.get_by_id(a.id).is_none());
        assert_eq!(holder.len(), 1);
    }

    #[tokio::test]
    async fn queue_slots() {
        let holder = Arc::new(Holder::new(1));
        holder.wait_for_slot().await;
        assert_eq!(holder.active(), 1);

        let waiting = {
            let holder = holder.clone();
            tokio::spawn(async move { holder.wait_for_slot().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        holder.release_slot();
        waiting.await.unwrap();
        assert_eq!(holder.active(), 1);

        holder.release_slot();
        holder.release_slot();
        assert_eq!(holder.active(), 0);
    }
}
