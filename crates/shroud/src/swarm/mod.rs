//! The swarm runs many torrents over one network session.
//!
//! The session is published through a [`watch`] channel. While there is
//! none, the accept loop and the announces of every torrent wait for the
//! next one, and the torrents keep their state.
mod holder;

pub use holder::*;

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::{
    io::AsyncReadExt,
    select,
    sync::{mpsc, watch},
    time::{interval, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::Error,
    magnet::Magnet,
    metainfo::MetaInfo,
    network::{BoxConn, Network, PeerAddr},
    peer::PeerId,
    status::SwarmStatus,
    storage::{Storage, TorrentStorage},
    torrent::{InfoHash, Torrent, TorrentParams},
    tracker::{Announcer, TrackerFactory},
    utils::lock,
    wire::{Handshake, HANDSHAKE_LEN, PSTR},
};

/// First bytes of a connection that speaks the secondary discovery
/// protocol instead of BitTorrent.
pub const GNUTELLA_HANDSHAKE: &[u8; 20] = b"GNUTELLA CONNECT/0.6";

/// How often every torrent is ticked.
pub const SWARM_TICK: Duration = Duration::from_millis(100);

/// A DHT payload a peer sent through the `xdht` extension.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtMessage {
    pub info_hash: InfoHash,
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Takes connections of the secondary discovery protocol, the handshake
/// line is already consumed.
pub type SecondaryHandler = Arc<dyn Fn(BoxConn, PeerAddr) + Send + Sync>;

pub struct Swarm {
    pub holder: Arc<Holder>,
    storage: Arc<dyn Storage>,
    config: Mutex<Config>,
    peer_id: Mutex<PeerId>,
    net_tx: watch::Sender<Option<Arc<dyn Network>>>,
    net_dead: AtomicBool,
    closing: AtomicBool,
    running: AtomicBool,
    cancel: CancellationToken,
    /// Trackers added to every torrent.
    trackers: Mutex<HashMap<String, Arc<dyn Announcer>>>,
    tracker_factory: Mutex<Option<TrackerFactory>>,
    dht: Mutex<Option<mpsc::Sender<DhtMessage>>>,
    secondary: Mutex<Option<SecondaryHandler>>,
}

impl Swarm {
    pub fn new(storage: Arc<dyn Storage>, config: Config) -> Arc<Self> {
        let (net_tx, _) = watch::channel(None);
        Arc::new(Self {
            holder: Arc::new(Holder::new(config.queue_size)),
            storage,
            config: Mutex::new(config),
            peer_id: Mutex::new(PeerId::generate()),
            net_tx,
            net_dead: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            trackers: Mutex::new(HashMap::new()),
            tracker_factory: Mutex::new(None),
            dht: Mutex::new(None),
            secondary: Mutex::new(None),
        })
    }

    /// Builds announcers out of the tracker urls of magnets and metainfo
    /// files.
    pub fn set_tracker_factory(&self, factory: TrackerFactory) {
        *lock(&self.tracker_factory) = Some(factory);
    }

    /// Where DHT payloads received from peers go, torrents added later
    /// advertise the `xdht` extension.
    pub fn set_dht_relay(&self, tx: mpsc::Sender<DhtMessage>) {
        *lock(&self.dht) = Some(tx);
    }

    pub fn set_secondary_handler(&self, handler: SecondaryHandler) {
        *lock(&self.secondary) = Some(handler);
    }

    pub fn config(&self) -> Config {
        lock(&self.config).clone()
    }

    pub fn peer_id(&self) -> PeerId {
        lock(&self.peer_id).clone()
    }

    pub fn is_online(&self) -> bool {
        !self.net_dead.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// A new network session, every torrent gets a fresh peer id.
    pub fn obtained_network(&self, net: Arc<dyn Network>) {
        let id = PeerId::generate();
        info!("network obtained at {}, peer id {id:?}", net.addr());
        *lock(&self.peer_id) = id.clone();
        for torrent in self.holder.torrents() {
            torrent.set_peer_id(id.clone());
        }
        self.net_dead.store(false, Ordering::Release);
        self.net_tx.send_replace(Some(net));
    }

    /// The network session is gone, everything waits for the next one.
    pub fn lost_network(&self) {
        info!("network lost");
        self.net_dead.store(true, Ordering::Release);
        self.net_tx.send_replace(None);
    }

    /// The current network session, waiting for one if there is none.
    pub async fn network(&self) -> Option<Arc<dyn Network>> {
        let mut rx = self.net_tx.subscribe();
        select! {
            _ = self.cancel.cancelled() => None,
            net = rx.wait_for(|net| net.is_some()) => {
                net.ok().and_then(|net| (*net).clone())
            }
        }
    }

    /// A tracker every torrent announces to.
    pub fn add_open_tracker(&self, announcer: Arc<dyn Announcer>) {
        let name = announcer.name();
        lock(&self.trackers)
            .entry(name)
            .or_insert_with(|| announcer.clone());
        for torrent in self.holder.torrents() {
            torrent.add_tracker(announcer.clone());
        }
    }

    fn resolve_trackers(&self, urls: &[String]) -> Vec<Arc<dyn Announcer>> {
        let Some(factory) = lock(&self.tracker_factory).clone() else {
            if !urls.is_empty() {
                debug!("no tracker factory, ignoring {} trackers", urls.len());
            }
            return Vec::new();
        };
        urls.iter().filter_map(|url| factory(url)).collect()
    }

    /// Register an opened torrent and start it once there is a network
    /// and a free slot.
    pub fn add_torrent(
        self: &Arc<Self>,
        storage: Arc<dyn TorrentStorage>,
        trackers: &[String],
    ) -> Result<Arc<Torrent>, Error> {
        let info_hash = storage.info_hash();
        if self.holder.contains(&info_hash) {
            return Err(Error::NoDuplicateTorrent(info_hash));
        }

        let torrent = Torrent::new(TorrentParams {
            id: self.holder.next_id(),
            storage,
            network: self.net_tx.subscribe(),
            config: self.config(),
            dht: lock(&self.dht).clone(),
            hook: Some(self.holder.hook()),
        });
        torrent.set_peer_id(self.peer_id());
        for announcer in self.resolve_trackers(trackers) {
            torrent.add_tracker(announcer);
        }

        self.holder.insert(torrent.clone())?;
        info!("{:?} added {}", info_hash, torrent.name());

        tokio::spawn(self.clone().start_torrent(torrent.clone()));
        Ok(torrent)
    }

    /// Add a torrent from a magnet uri, its info dictionary is fetched
    /// from peers.
    pub fn add_magnet(self: &Arc<Self>, uri: &str) -> Result<Arc<Torrent>, Error> {
        let magnet = Magnet::new(uri)?;
        let info_hash = magnet.info_hash()?;
        let storage = self.storage.empty_torrent(info_hash, &magnet.parse_dn())?;
        self.add_torrent(storage, &magnet.trackers())
    }

    /// Add a torrent from a `.torrent` file, its data is verified first.
    pub async fn add_file_torrent(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
    ) -> Result<Arc<Torrent>, Error> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let meta_info = MetaInfo::from_bytes(&bytes)?;
        info!("loaded torrent from {path:?}");

        let storage = self.storage.open_torrent(&meta_info)?;
        storage.verify_all()?;
        self.add_torrent(storage, &meta_info.trackers())
    }

    /// Add a torrent from a magnet uri or a path, optionally prefixed
    /// with `file://`.
    pub async fn add_remote_torrent(
        self: &Arc<Self>,
        src: &str,
    ) -> Result<Arc<Torrent>, Error> {
        if src.starts_with("magnet:") {
            return self.add_magnet(src);
        }
        if let Some(path) = src.strip_prefix("file://") {
            return self.add_file_torrent(path).await;
        }
        match src.split_once("://") {
            Some((scheme, _)) => Err(Error::UnsupportedSource(scheme.to_owned())),
            None => self.add_file_torrent(src).await,
        }
    }

    async fn start_torrent(self: Arc<Self>, torrent: Arc<Torrent>) {
        if self.network().await.is_none() {
            return;
        }
        torrent.set_peer_id(self.peer_id());
        let open: Vec<_> = lock(&self.trackers).values().cloned().collect();
        for announcer in open {
            torrent.add_tracker(announcer);
        }

        self.holder.wait_for_slot().await;
        if self.is_closing() || !self.holder.contains(&torrent.info_hash()) {
            self.holder.release_slot();
            return;
        }
        if let Err(e) = torrent.start() {
            debug!("{:?} {e}", torrent.info_hash());
            self.holder.release_slot();
        }
    }

    fn torrent(&self, info_hash: &InfoHash) -> Result<Arc<Torrent>, Error> {
        self.holder.get(info_hash).ok_or(Error::TorrentDoesNotExist)
    }

    pub fn torrent_by_id(&self, id: u64) -> Option<Arc<Torrent>> {
        self.holder.get_by_id(id)
    }

    /// Start a registered torrent that isn't running, e.g. one whose start failed.
    pub fn start(self: &Arc<Self>, info_hash: &InfoHash) -> Result<(), Error> {
        let torrent = self.torrent(info_hash)?;
        if torrent.started() {
            return Err(Error::AlreadyStarted);
        }
        tokio::spawn(self.clone().start_torrent(torrent));
        Ok(())
    }

    /// Stop and forget a torrent, its data is kept.
    pub async fn stop(&self, info_hash: &InfoHash) -> Result<(), Error> {
        self.torrent(info_hash)?.stop().await
    }

    /// Like [`Swarm::stop`], but also forgets a torrent that never started.
    pub async fn remove(&self, info_hash: &InfoHash) -> Result<(), Error> {
        self.torrent(info_hash)?.remove().await
    }

    /// Stop and forget a torrent, and delete its data.
    pub async fn delete(&self, info_hash: &InfoHash) -> Result<(), Error> {
        self.torrent(info_hash)?.delete().await
    }

    /// Change how many blocks may be in flight on every connection.
    pub fn set_piece_window(&self, n: usize) {
        lock(&self.config).piece_window = n;
        for torrent in self.holder.torrents() {
            torrent.set_piece_window(n);
        }
    }

    /// Relay a DHT payload to peer `to` of a torrent.
    pub async fn send_dht(
        &self,
        info_hash: &InfoHash,
        to: &PeerId,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.torrent(info_hash)?.send_dht(to, payload).await
    }

    pub fn status(&self) -> SwarmStatus {
        SwarmStatus {
            torrents: self.holder.torrents().iter().map(|t| t.status()).collect(),
        }
    }

    /// Accept connections and tick every torrent until the swarm is
    /// closed.
    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        tokio::spawn(self.clone().accept_loop());

        let mut ticker = interval(SWARM_TICK);
        loop {
            select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let torrents = self.holder.torrents();
                    join_all(torrents.iter().map(|t| t.tick())).await;
                }
            }
        }
    }

    /// Stop every loop and every torrent. The trackers are only told when
    /// there is a network.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("swarm closing");
        self.holder.close(self.is_online()).await;
        self.cancel.cancel();
    }

    #[tracing::instrument(skip_all)]
    async fn accept_loop(self: Arc<Self>) {
        let mut rx = self.net_tx.subscribe();

        loop {
            let net = select! {
                _ = self.cancel.cancelled() => return,
                net = rx.wait_for(|net| net.is_some()) => {
                    match net {
                        Ok(net) => (*net).clone(),
                        Err(_) => return,
                    }
                }
            };
            let Some(net) = net else { continue };

            let accepted = select! {
                _ = self.cancel.cancelled() => return,
                // the session changed, accept on the new one
                _ = rx.changed() => continue,
                accepted = net.accept() => accepted,
            };

            match accepted {
                Ok((conn, addr)) => {
                    debug!("{addr} inbound connection");
                    tokio::spawn(self.clone().inbound_conn(conn, addr));
                }
                Err(Error::NetworkClosed) => {
                    debug!("network session closed");
                    sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    warn!("failed to accept inbound connection: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn inbound_conn(self: Arc<Self>, conn: BoxConn, addr: PeerAddr) {
        if let Err(e) = self.handle_inbound(conn, &addr).await {
            debug!("{addr} inbound connection closed: {e}");
        }
    }

    /// Tell BitTorrent apart from the secondary protocol by the first 20
    /// bytes.
    async fn handle_inbound(&self, mut conn: BoxConn, addr: &PeerAddr) -> Result<(), Error> {
        let handshake_timeout =
            Duration::from_secs(lock(&self.config).handshake_timeout_secs);
        let mut buf = [0u8; HANDSHAKE_LEN];

        timeout(handshake_timeout, conn.read_exact(&mut buf[..20]))
            .await
            .map_err(|_| Error::HandshakeTimeout)??;

        if buf[0] == PSTR.len() as u8 {
            timeout(handshake_timeout, conn.read_exact(&mut buf[20..]))
                .await
                .map_err(|_| Error::HandshakeTimeout)??;
            let theirs = Handshake::deserialize(&buf)?;

            let Some(torrent) = self.holder.get(&theirs.info_hash) else {
                warn!("{addr} asked for unknown torrent {:?}", theirs.info_hash);
                return Err(Error::TorrentDoesNotExist);
            };
            if !torrent.should_accept_new_peer() {
                return Err(Error::PeerRejected);
            }

            let ours = Handshake::new(theirs.info_hash.clone(), torrent.peer_id());
            ours.send(&mut conn).await?;
            return torrent.on_new_inbound(conn, addr.clone(), &theirs).await;
        }

        if &buf[..20] == GNUTELLA_HANDSHAKE {
            let mut crlf = [0u8; 2];
            timeout(handshake_timeout, conn.read_exact(&mut crlf))
                .await
                .map_err(|_| Error::HandshakeTimeout)??;

            let handler = lock(&self.secondary).clone();
            match handler {
                Some(handler) => handler(conn, addr.clone()),
                None => debug!("{addr} secondary protocol not enabled"),
            }
            return Ok(());
        }

        debug!("{addr} unknown protocol");
        Err(Error::HandshakeInvalid)
    }
}
