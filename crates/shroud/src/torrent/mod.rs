//! A torrent, its connections and its trackers.
//!
//! The [`Torrent`] owns its [`PeerConn`]s, keyed by remote address in an
//! inbound and an outbound map, and the [`PieceTracker`] of the pieces being
//! assembled. Once started it runs two tasks: the announce loop and a one
//! second loop for rates, seeding and metadata retries. The download itself
//! is driven by [`Torrent::tick`], which the swarm calls for every torrent.
mod announce;
mod info_buffer;
mod types;

// re-exports
pub use announce::*;
pub use info_buffer::*;
pub use types::*;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{interval, sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    config::Config,
    counter::Counter,
    error::Error,
    extensions::{Extension, PexState},
    network::{BoxConn, Network, PeerAddr, DEFAULT_PORT},
    peer::{Direction, PeerConn, PeerId},
    piece_tracker::{PieceOutcome, PieceTracker},
    status::TorrentStatus,
    storage::{TorrentStorage, TransferStats},
    swarm::DhtMessage,
    tracker::{AnnounceRequest, Announcer, Event, DEFAULT_NUM_WANT},
    utils::lock,
    wire::{Block, BlockInfo, Handshake, Message, BLOCK_LEN},
};

/// Peer exchange messages are sent this often.
pub const PEX_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Seconds without the info dictionary before every chunk is asked again.
pub const METADATA_RETRY_TICKS: u32 = 30;

/// Dial attempts made for an address before giving up.
pub const PERSIST_ATTEMPTS: u32 = 10;

const PERSIST_SLEEP: Duration = Duration::from_secs(1);

/// Lifecycle events reported to whoever holds the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentEvent {
    /// The torrent was stopped and no longer counts as active.
    Stopped,
    /// The torrent must be dropped from the registry.
    Removed,
}

pub type EventHook = Arc<dyn Fn(&InfoHash, TorrentEvent) + Send + Sync>;

/// Everything a torrent is built from.
pub struct TorrentParams {
    pub id: u64,
    pub storage: Arc<dyn TorrentStorage>,
    /// Where the current network session is published.
    pub network: watch::Receiver<Option<Arc<dyn Network>>>,
    pub config: Config,
    pub dht: Option<mpsc::Sender<DhtMessage>>,
    pub hook: Option<EventHook>,
}

pub struct Torrent {
    pub id: u64,
    pub counter: Counter,
    info_hash: InfoHash,
    storage: Arc<dyn TorrentStorage>,
    tracker: PieceTracker,
    net: watch::Receiver<Option<Arc<dyn Network>>>,
    peer_id: Mutex<PeerId>,
    inbound: Mutex<HashMap<PeerAddr, Arc<PeerConn>>>,
    outbound: Mutex<HashMap<PeerAddr, Arc<PeerConn>>>,
    /// Addresses with a dial loop running.
    dialing: Mutex<HashSet<PeerAddr>>,
    announcers: Mutex<HashMap<String, Arc<TorrentAnnounce>>>,
    /// Our extension table.
    ours: Mutex<Extension>,
    info_buffer: Mutex<InfoBuffer>,
    pex: PexState,
    last_pex: Mutex<Instant>,
    max_peers: usize,
    max_requests: AtomicUsize,
    pex_enabled: bool,
    handshake_timeout: Duration,
    started: AtomicBool,
    closing: AtomicBool,
    seeding: AtomicBool,
    dht: Option<mpsc::Sender<DhtMessage>>,
    cancel: Mutex<CancellationToken>,
    hook: Option<EventHook>,
    me: Weak<Self>,
}

impl Torrent {
    pub fn new(params: TorrentParams) -> Arc<Self> {
        let TorrentParams { id, storage, network, config, dht, hook } = params;

        let metadata_size = storage.meta_info().map(|i| i.raw.len() as u32);
        let counter = Counter::new();
        let stats = storage.stats();
        counter.restore(stats.downloaded, stats.uploaded);

        Arc::new_cyclic(|me| Self {
            id,
            counter,
            info_hash: storage.info_hash(),
            tracker: PieceTracker::new(storage.clone()),
            storage,
            net: network,
            peer_id: Mutex::new(PeerId::generate()),
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            announcers: Mutex::new(HashMap::new()),
            ours: Mutex::new(Extension::supported(metadata_size, dht.is_some())),
            info_buffer: Mutex::new(InfoBuffer::default()),
            pex: PexState::default(),
            last_pex: Mutex::new(Instant::now()),
            max_peers: config.max_peers,
            max_requests: AtomicUsize::new(config.piece_window),
            pex_enabled: config.pex,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            seeding: AtomicBool::new(false),
            dht,
            cancel: Mutex::new(CancellationToken::new()),
            hook,
            me: me.clone(),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash.clone()
    }

    pub fn name(&self) -> String {
        self.storage.name()
    }

    pub fn storage(&self) -> &Arc<dyn TorrentStorage> {
        &self.storage
    }

    /// The info dictionary is known.
    pub fn ready(&self) -> bool {
        self.storage.meta_info().is_some()
    }

    pub fn num_pieces(&self) -> Option<u32> {
        self.storage.num_pieces()
    }

    pub fn bitfield(&self) -> Option<Bitfield> {
        self.storage.bitfield()
    }

    /// Every piece is downloaded.
    pub fn done(&self) -> bool {
        self.bitfield().is_some_and(|b| b.completed())
    }

    pub fn private(&self) -> bool {
        self.storage.meta_info().is_some_and(|i| i.private)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TorrentState {
        if self.storage.checking() {
            TorrentState::Checking
        } else if self.closing() || !self.started() {
            TorrentState::Stopped
        } else if self.done() {
            TorrentState::Seeding
        } else {
            TorrentState::Downloading
        }
    }

    pub fn peer_id(&self) -> PeerId {
        lock(&self.peer_id).clone()
    }

    pub fn set_peer_id(&self, id: PeerId) {
        *lock(&self.peer_id) = id;
    }

    /// Add a tracker, a tracker with the same name is kept.
    pub fn add_tracker(&self, announcer: Arc<dyn Announcer>) {
        let name = announcer.name();
        lock(&self.announcers)
            .entry(name)
            .or_insert_with(|| Arc::new(TorrentAnnounce::new(announcer)));
    }

    fn announcers(&self) -> Vec<Arc<TorrentAnnounce>> {
        lock(&self.announcers).values().cloned().collect()
    }

    fn conns(&self, direction: Direction) -> &Mutex<HashMap<PeerAddr, Arc<PeerConn>>> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Every connection, inbound ones first.
    pub fn peers(&self) -> Vec<Arc<PeerConn>> {
        let mut peers: Vec<_> = lock(&self.inbound).values().cloned().collect();
        peers.extend(lock(&self.outbound).values().cloned());
        peers
    }

    pub fn num_peers(&self) -> usize {
        lock(&self.inbound).len() + lock(&self.outbound).len()
    }

    fn is_connected(&self, addr: &PeerAddr) -> bool {
        lock(&self.inbound).contains_key(addr)
            || lock(&self.outbound).contains_key(addr)
    }

    /// Started, not closing and below the connection cap.
    pub fn needs_peers(&self) -> bool {
        self.started() && !self.closing() && self.num_peers() < self.max_peers
    }

    /// Whether an inbound connection may be handed to this torrent.
    pub fn should_accept_new_peer(&self) -> bool {
        matches!(self.state(), TorrentState::Downloading | TorrentState::Seeding)
            && self.ready()
            && self.num_peers() < self.max_peers
    }

    /// The current network session, waiting for one if there is none.
    /// `None` once the swarm is gone.
    pub async fn network(&self) -> Option<Arc<dyn Network>> {
        let mut rx = self.net.clone();
        let net = rx.wait_for(|net| net.is_some()).await.ok()?;
        let net = (*net).clone();
        net
    }

    /// The current network session, if any.
    pub fn current_network(&self) -> Option<Arc<dyn Network>> {
        (*self.net.borrow()).clone()
    }

    /// Start announcing and driving the download.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }
        self.closing.store(false, Ordering::Release);

        if self.ready() {
            if let Err(e) = self.storage.allocate() {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        }

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = cancel.clone();

        tokio::spawn(self.clone().announce_loop(cancel.clone()));
        tokio::spawn(self.clone().run(cancel));

        info!("{:?} started", self.info_hash);
        Ok(())
    }

    /// Close every connection and persist the stats, without telling the
    /// trackers. Calling it again does nothing.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.started.store(false, Ordering::Release);
        lock(&self.cancel).cancel();
        self.close_peers();

        let stats = TransferStats {
            uploaded: self.counter.uploaded(),
            downloaded: self.counter.downloaded(),
        };
        if let Err(e) = self.storage.save_stats(&stats) {
            warn!("{:?} failed to save stats: {e}", self.info_hash);
        }
        if let Err(e) = self.storage.flush() {
            warn!("{:?} failed to flush: {e}", self.info_hash);
        }
        debug!("{:?} closed", self.info_hash);
    }

    fn close_peers(&self) {
        for peer in self.peers() {
            peer.close();
        }
    }

    /// Close, tell every tracker we stopped and drop the torrent from its
    /// registry. The data is kept.
    pub async fn stop(&self) -> Result<(), Error> {
        if self.closing() || !self.started() {
            return Err(Error::AlreadyStopped);
        }
        info!("{:?} stopping", self.info_hash);
        self.close();
        self.stop_announcing().await;
        self.emit(TorrentEvent::Stopped);
        self.emit(TorrentEvent::Removed);
        info!("{:?} stopped", self.info_hash);
        Ok(())
    }

    /// Like [`Torrent::stop`], but also drops a torrent that never started.
    pub async fn remove(&self) -> Result<(), Error> {
        match self.stop().await {
            Ok(()) => Ok(()),
            Err(Error::AlreadyStopped) => {
                self.emit(TorrentEvent::Removed);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop, delete the data and drop the torrent from its registry.
    pub async fn delete(&self) -> Result<(), Error> {
        match self.stop().await {
            Ok(()) | Err(Error::AlreadyStopped) => {}
            Err(e) => return Err(e),
        }
        self.storage.delete()?;
        self.emit(TorrentEvent::Removed);
        Ok(())
    }

    fn emit(&self, event: TorrentEvent) {
        if let Some(hook) = &self.hook {
            hook(&self.info_hash, event);
        }
    }

    fn announce_request(&self, event: Event, net: &dyn Network) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash.clone(),
            peer_id: self.peer_id(),
            event,
            uploaded: self.counter.uploaded(),
            downloaded: self.counter.downloaded(),
            left: self.storage.download_remaining(),
            num_want: if event == Event::Stopped { 0 } else { DEFAULT_NUM_WANT },
            port: net.addr().port().unwrap_or(DEFAULT_PORT),
        }
    }

    async fn announce_to(
        self: &Arc<Self>,
        tracker: &TorrentAnnounce,
        event: Event,
        net: &dyn Network,
    ) {
        let req = self.announce_request(event, net);
        if let Ok(peers) = tracker.try_announce(req).await {
            if !peers.is_empty() {
                self.add_peers(peers);
            }
        }
    }

    /// Announce `event` to every tracker right away.
    pub async fn announce_all(self: &Arc<Self>, event: Event) {
        let Some(net) = self.current_network() else {
            debug!("{:?} no network, not announcing {event:?}", self.info_hash);
            return;
        };
        let trackers = self.announcers();
        join_all(trackers.iter().map(|t| self.announce_to(t, event, net.as_ref())))
            .await;
    }

    /// Send a stopped announce to every tracker and wait for all of them.
    pub async fn stop_announcing(&self) {
        let Some(net) = self.current_network() else { return };
        let trackers = self.announcers();
        join_all(trackers.iter().map(|t| {
            let req = self.announce_request(Event::Stopped, net.as_ref());
            async move {
                let name = t.name();
                if let Err(e) = t.try_announce(req).await {
                    debug!("{name} stopped announce failed: {e}");
                }
            }
        }))
        .await;
    }

    #[tracing::instrument(skip_all, fields(info_hash = ?self.info_hash))]
    async fn announce_loop(self: Arc<Self>, cancel: CancellationToken) {
        for tracker in self.announcers() {
            tracker.reset().await;
        }

        let mut ticker = interval(Duration::from_secs(1));

        loop {
            select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let net = select! {
                _ = cancel.cancelled() => return,
                net = self.network() => net,
            };
            let Some(net) = net else { return };

            let now = Instant::now();
            let done = self.done();
            let mut due = Vec::new();
            for tracker in self.announcers() {
                if tracker.should_announce(now).await {
                    let event = tracker.next_event(done).await;
                    due.push((tracker, event));
                }
            }
            if due.is_empty() {
                continue;
            }

            let announces = due
                .iter()
                .map(|(t, event)| self.announce_to(t, *event, net.as_ref()));
            select! {
                _ = cancel.cancelled() => return,
                _ = join_all(announces) => {}
            }
        }
    }

    #[tracing::instrument(skip_all, fields(info_hash = ?self.info_hash))]
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(1));
        let mut ticks_without_info = 0u32;

        loop {
            select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            self.counter.update_rates();
            for peer in self.peers() {
                peer.counter.update_rates();
            }

            if !self.ready() {
                ticks_without_info += 1;
                if ticks_without_info % METADATA_RETRY_TICKS == 0 {
                    debug!("still no info dictionary, asking every peer again");
                    lock(&self.info_buffer).reset_requesting();
                    self.ask_all_metadata().await;
                }
                continue;
            }

            if self.done() && !self.seeding.load(Ordering::Acquire) {
                match self.storage.seed() {
                    Ok(true) => {
                        info!("{:?} download complete, seeding", self.info_hash);
                        self.seeding.store(true, Ordering::Release);
                        self.announce_all(Event::Completed).await;
                    }
                    Ok(false) => {
                        warn!(
                            "{:?} pieces failed the deep check, they will be \
                             downloaded again",
                            self.info_hash
                        );
                    }
                    Err(e) => error!("{:?} failed to seed: {e}", self.info_hash),
                }
            }
        }
    }

    /// Exchange peers, expire stale pieces and drive the download of every
    /// connection.
    pub async fn tick(self: &Arc<Self>) {
        if !self.started() || self.closing() {
            return;
        }
        let peers = self.peers();

        if self.pex_enabled && !self.private() {
            let due = {
                let mut last = lock(&self.last_pex);
                let due = last.elapsed() >= PEX_INTERVAL;
                if due {
                    *last = Instant::now();
                }
                due
            };
            if due {
                let pex = self.pex.pop();
                if !pex.added.is_empty() || !pex.dropped.is_empty() {
                    for peer in &peers {
                        peer.send_pex(&pex).await;
                    }
                }
            }
        }

        if self.ready() && !self.done() {
            self.expire_pieces(Instant::now()).await;
        }

        for peer in &peers {
            peer.tick_download(self).await;
        }
    }

    /// Reset the pieces idle at `now` and cancel their requests on every
    /// connection.
    pub(crate) async fn expire_pieces(&self, now: Instant) {
        let expired = self.tracker.expire(now);
        if expired.is_empty() {
            return;
        }
        let peers = self.peers();
        for index in expired {
            for peer in &peers {
                peer.cancel_piece(index).await;
            }
        }
    }

    /// Change the request window of this torrent and of every connection.
    pub fn set_piece_window(&self, n: usize) {
        self.max_requests.store(n, Ordering::Relaxed);
        for peer in self.peers() {
            peer.set_max_requests(n);
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests.load(Ordering::Relaxed)
    }

    /// Register a connection that completed its handshake and start it.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        conn: BoxConn,
        addr: PeerAddr,
        id: PeerId,
        direction: Direction,
        extended: bool,
    ) -> Arc<PeerConn> {
        let ours = extended.then(|| lock(&self.ours).clone());
        let (peer, rx) = PeerConn::new(
            Arc::downgrade(self),
            addr.clone(),
            id,
            direction,
            ours,
            self.max_requests(),
        );

        let old = lock(self.conns(direction)).insert(addr.clone(), peer.clone());
        if let Some(old) = old {
            old.close();
        }
        self.pex.on_connected(&addr);

        peer.start(conn, rx);
        if let Some(bitfield) = self.bitfield() {
            peer.send(Message::Bitfield(bitfield)).await;
        }
        peer
    }

    /// Drop a closed connection from the maps, if it is still the one
    /// registered for its address.
    pub fn remove_conn(&self, conn: &PeerConn) {
        let removed = {
            let mut map = lock(self.conns(conn.direction));
            let registered = map
                .get(&conn.addr)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn));
            if registered {
                map.remove(&conn.addr);
            }
            registered
        };
        if removed {
            self.pex.on_disconnected(&conn.addr);
        }
    }

    /// Take an inbound connection whose handshake was already answered.
    pub async fn on_new_inbound(
        self: &Arc<Self>,
        conn: BoxConn,
        addr: PeerAddr,
        handshake: &Handshake,
    ) -> Result<(), Error> {
        if self.is_connected(&addr) {
            debug!("{addr} already connected, rejecting");
            return Err(Error::PeerRejected);
        }
        if !self.should_accept_new_peer() {
            debug!("{addr} not accepting new peers");
            return Err(Error::PeerRejected);
        }
        debug!("{addr} inbound connection");
        self.attach(
            conn,
            addr,
            handshake.peer_id.clone(),
            Direction::Inbound,
            handshake.reserved().supports_extended(),
        )
        .await;
        Ok(())
    }

    /// Resolve and dial peers until the torrent has enough.
    pub fn add_peers(self: &Arc<Self>, peers: Vec<PeerAddr>) {
        if !self.needs_peers() {
            return;
        }
        let torrent = self.clone();

        tokio::spawn(async move {
            let Some(net) = torrent.current_network() else { return };
            let me = net.addr();

            for name in peers {
                if !torrent.needs_peers() {
                    break;
                }
                let addr = match net.lookup(&name.0).await {
                    Ok(addr) => addr,
                    Err(e) => {
                        debug!("failed to resolve {name}: {e}");
                        continue;
                    }
                };
                if addr == me || lock(&torrent.outbound).contains_key(&addr) {
                    continue;
                }
                if !lock(&torrent.dialing).insert(addr.clone()) {
                    continue;
                }
                tokio::spawn(torrent.clone().persist_peer(addr));
            }
        });
    }

    async fn persist_peer(self: Arc<Self>, addr: PeerAddr) {
        for attempt in 1..=PERSIST_ATTEMPTS {
            if !self.needs_peers() || lock(&self.inbound).contains_key(&addr) {
                break;
            }
            if !lock(&self.outbound).contains_key(&addr) {
                if let Err(e) = self.dial_peer(&addr).await {
                    debug!("{addr} dial attempt {attempt} failed: {e}");
                }
            }
            sleep(PERSIST_SLEEP).await;
        }
        lock(&self.dialing).remove(&addr);
    }

    /// Dial, handshake and register an outbound connection.
    pub async fn dial_peer(self: &Arc<Self>, addr: &PeerAddr) -> Result<(), Error> {
        let net = self.current_network().ok_or(Error::NoNetwork)?;
        let ours = Handshake::new(self.info_hash(), self.peer_id());

        let (conn, theirs) = timeout(self.handshake_timeout, async {
            let mut conn = net.dial(addr).await?;
            ours.send(&mut conn).await?;
            let theirs = Handshake::recv(&mut conn).await?;
            Ok::<_, Error>((conn, theirs))
        })
        .await
        .map_err(|_| Error::HandshakeTimeout)??;

        if theirs.info_hash != self.info_hash {
            warn!("{addr} answered with a different info hash");
            return Err(Error::InfoHashMismatch);
        }
        if self.closing() {
            return Err(Error::ConnectionClosed);
        }

        debug!("{addr} outbound connection");
        self.attach(
            conn,
            addr.clone(),
            theirs.peer_id.clone(),
            Direction::Outbound,
            theirs.reserved().supports_extended(),
        )
        .await;
        Ok(())
    }

    /// Serve a block to `peer`. Requests that can't be valid close the
    /// connection.
    pub async fn handle_piece_request(&self, peer: &Arc<PeerConn>, info: BlockInfo) {
        if info.len == 0 || info.len > BLOCK_LEN {
            warn!("{} requested {} bytes, closing", peer.addr, info.len);
            peer.close();
            return;
        }
        match self.tracker.read_block(&info) {
            Ok(block) => peer.queue_upload(block).await,
            Err(e) => {
                warn!("{} failed to read {info:?}: {e}, closing", peer.addr);
                peer.close();
            }
        }
    }

    /// Store a block received from a peer.
    pub async fn handle_piece_data(&self, block: &Block) {
        if let PieceOutcome::Completed(index) = self.tracker.handle_piece_data(block) {
            debug!("{:?} piece {index} completed", self.info_hash);
            self.broadcast_have(index).await;
        }
    }

    pub async fn broadcast_have(&self, index: u32) {
        for peer in self.peers() {
            peer.send(Message::Have(index)).await;
        }
    }

    /// The next block to ask a peer that has `remote`, rarest pieces first.
    pub fn next_request(
        &self,
        remote: &Bitfield,
        last: Option<&BlockInfo>,
    ) -> Option<BlockInfo> {
        let local = self.bitfield()?;
        let others: Vec<Bitfield> =
            self.peers().iter().filter_map(|p| p.bitfield()).collect();

        self.tracker.next_request(last, |pending| {
            remote
                .find_rarest(&others, |i| {
                    local.safe_get(i) || pending.contains(&(i as u32))
                })
                .map(|i| i as u32)
        })
    }

    pub fn canceled_request(&self, info: &BlockInfo) {
        self.tracker.canceled_request(info);
    }

    /// Pieces with blocks asked to some peer.
    pub fn pending_pieces(&self) -> Vec<u32> {
        self.tracker.pending_pieces()
    }

    /// Size the metadata buffer with the size a peer advertised.
    pub fn prepare_metadata(&self, size: u32) -> Result<(), Error> {
        lock(&self.info_buffer).init(size)
    }

    pub fn next_metadata_request(&self) -> Option<u32> {
        lock(&self.info_buffer).next_request()
    }

    pub fn metadata_rejected(&self, piece: u32) {
        lock(&self.info_buffer).unset_requesting(piece);
    }

    /// The bencoded info dictionary, to serve to peers.
    pub fn metadata_bytes(&self) -> Option<Vec<u8>> {
        Some(self.storage.meta_info()?.raw.clone())
    }

    /// Store a chunk of the info dictionary, once complete it is handed to
    /// storage and every connection is reopened.
    pub async fn put_info_slice(&self, piece: u32, data: &[u8]) {
        let complete = {
            let mut buf = lock(&self.info_buffer);
            if buf.is_empty() || self.ready() {
                return;
            }
            buf.put(piece, data).then(|| buf.bytes().to_vec())
        };
        let Some(bytes) = complete else { return };

        match self.storage.put_info(&bytes) {
            Ok(()) => {
                info!("{:?} got the info dictionary", self.info_hash);
                lock(&self.ours).metadata_size = Some(bytes.len() as u32);
                *lock(&self.info_buffer) = InfoBuffer::default();
                if let Err(e) = self.storage.allocate() {
                    error!("{:?} failed to allocate: {e}", self.info_hash);
                }

                // reconnect so both sides exchange real bitfields
                let addrs: Vec<PeerAddr> =
                    lock(&self.outbound).keys().cloned().collect();
                self.close_peers();
                if let Some(me) = self.me.upgrade() {
                    me.add_peers(addrs);
                }
            }
            Err(e) => {
                warn!("{:?} info dictionary rejected: {e}", self.info_hash);
                lock(&self.info_buffer).reset();
                self.ask_all_metadata().await;
            }
        }
    }

    pub async fn ask_all_metadata(&self) {
        for peer in self.peers() {
            peer.ask_next_metadata(self).await;
        }
    }

    /// Hand a DHT payload received from a peer to the swarm relay.
    pub fn relay_dht(&self, from: &PeerId, payload: Vec<u8>) {
        let Some(dht) = &self.dht else {
            debug!("no dht relay, dropping message from {from:?}");
            return;
        };
        let msg = DhtMessage {
            info_hash: self.info_hash(),
            from: from.clone(),
            payload,
        };
        if dht.try_send(msg).is_err() {
            debug!("dht relay is full, dropping message from {from:?}");
        }
    }

    /// Send a DHT payload to the connection of peer `to`.
    pub async fn send_dht(&self, to: &PeerId, payload: Vec<u8>) -> Result<(), Error> {
        let peer = self
            .peers()
            .into_iter()
            .find(|p| &p.id == to)
            .ok_or(Error::ConnectionClosed)?;
        peer.send_dht(payload).await;
        Ok(())
    }

    pub fn status(&self) -> TorrentStatus {
        TorrentStatus {
            files: self.storage.file_list(),
            peers: self.peers().iter().map(|p| p.stats()).collect(),
            name: self.name(),
            state: self.state(),
            infohash: self.info_hash.to_string(),
            progress: self.bitfield().map(|b| b.progress()).unwrap_or(0.0),
            tx: self.counter.upload_rate(),
            rx: self.counter.download_rate(),
            uploaded: self.counter.uploaded(),
            downloaded: self.counter.downloaded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures::{SinkExt, StreamExt};
    use tokio::io::duplex;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        extensions::METADATA_PIECE_LEN,
        metainfo::Info,
        piece_tracker::PIECE_EXPIRY,
        storage::MemoryTorrent,
        wire::MessageCodec,
    };

    type Remote = Framed<tokio::io::DuplexStream, MessageCodec>;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 233) as u8).collect()
    }

    fn torrent(
        storage: Arc<dyn TorrentStorage>,
        hook: Option<EventHook>,
    ) -> (Arc<Torrent>, watch::Sender<Option<Arc<dyn Network>>>) {
        let (tx, network) = watch::channel(None);
        let torrent = Torrent::new(TorrentParams {
            id: 7,
            storage,
            network,
            config: Config::default(),
            dht: None,
            hook,
        });
        (torrent, tx)
    }

    /// Attach a remote that has every piece and unchokes us.
    async fn seeder(torrent: &Arc<Torrent>, pieces: usize) -> (Arc<PeerConn>, Remote) {
        let (local, remote) = duplex(1 << 20);
        let peer = torrent
            .attach(
                Box::new(local),
                PeerAddr::from("seed:1"),
                PeerId::generate(),
                Direction::Outbound,
                false,
            )
            .await;
        let mut remote = Framed::new(remote, MessageCodec::default());

        let mut all = Bitfield::from_piece(pieces);
        all.fill(true);
        remote.send(Message::Bitfield(all)).await.unwrap();
        remote.send(Message::Unchoke).await.unwrap();
        (peer, remote)
    }

    /// Tick the connection until `n` requests are in flight.
    async fn fill_window(torrent: &Torrent, peer: &PeerConn, n: usize) {
        timeout(Duration::from_secs(5), async {
            while peer.in_flight() < n {
                peer.tick_download(torrent).await;
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stop_twice() {
        let info = Info::new("t", BLOCK_LEN, None, &data(100)).unwrap();
        let stopped = Arc::new(AtomicU32::new(0));
        let removed = Arc::new(AtomicU32::new(0));
        let (on_stop, on_remove) = (stopped.clone(), removed.clone());
        let hook: EventHook = Arc::new(move |_, event| match event {
            TorrentEvent::Stopped => {
                on_stop.fetch_add(1, Ordering::Relaxed);
            }
            TorrentEvent::Removed => {
                on_remove.fetch_add(1, Ordering::Relaxed);
            }
        });
        let (torrent, _net) = torrent(Arc::new(MemoryTorrent::new(info)), Some(hook));

        assert_eq!(torrent.state(), TorrentState::Stopped);
        torrent.start().unwrap();
        assert!(matches!(torrent.start(), Err(Error::AlreadyStarted)));
        assert_eq!(torrent.state(), TorrentState::Downloading);

        torrent.stop().await.unwrap();
        assert!(matches!(torrent.stop().await, Err(Error::AlreadyStopped)));
        assert_eq!(stopped.load(Ordering::Relaxed), 1);
        // stopping drops the torrent from its registry
        assert_eq!(removed.load(Ordering::Relaxed), 1);
        assert_eq!(torrent.state(), TorrentState::Stopped);

        // a stopped torrent can run again
        torrent.start().unwrap();
        assert_eq!(torrent.state(), TorrentState::Downloading);
        torrent.close();
    }

    #[tokio::test]
    async fn invalid_piece_is_not_marked() {
        let data = data(2 * BLOCK_LEN as usize);
        let info = Info::new("t", 2 * BLOCK_LEN, None, &data).unwrap();
        let (torrent, _net) = torrent(Arc::new(MemoryTorrent::new(info)), None);

        let mut remote = Bitfield::from_piece(1);
        remote.fill(true);

        let first = torrent.next_request(&remote, None).unwrap();
        let second = torrent.next_request(&remote, Some(&first)).unwrap();
        assert_eq!(torrent.next_request(&remote, Some(&second)), None);

        for r in [first, second] {
            let block = Block { index: 0, begin: r.begin, block: vec![9; r.len as usize] };
            torrent.handle_piece_data(&block).await;
        }

        assert!(torrent.pending_pieces().is_empty());
        assert_eq!(torrent.bitfield().map(|b| b.count_set()), Some(0));
        // the piece can be picked again
        assert_eq!(torrent.next_request(&remote, None).map(|r| r.begin), Some(0));
    }

    #[tokio::test]
    async fn serves_blocks_and_closes_on_bad_requests() {
        let data = data(3 * BLOCK_LEN as usize);
        let info = Info::new("t", BLOCK_LEN, None, &data).unwrap();
        let storage = MemoryTorrent::with_data(info, data.clone()).unwrap();
        let (torrent, _net) = torrent(Arc::new(storage), None);
        torrent.start().unwrap();
        assert_eq!(torrent.state(), TorrentState::Seeding);

        let (local, remote) = duplex(1 << 20);
        let peer = torrent
            .attach(
                Box::new(local),
                PeerAddr::from("leech:1"),
                PeerId::generate(),
                Direction::Inbound,
                false,
            )
            .await;
        let mut remote = Framed::new(remote, MessageCodec::default());

        // our bitfield comes first
        match remote.next().await.unwrap().unwrap() {
            Message::Bitfield(b) => assert_eq!(&b[..3], &Bitfield::repeat(true, 3)[..]),
            other => panic!("expected a bitfield, got {other:?}"),
        }

        remote.send(Message::Bitfield(Bitfield::from_piece(8))).await.unwrap();
        let r = BlockInfo::new().index(2).begin(0).len(BLOCK_LEN);
        remote.send(Message::Request(r)).await.unwrap();

        let block = loop {
            match remote.next().await.unwrap().unwrap() {
                Message::Piece(block) => break block,
                _ => continue,
            }
        };
        assert_eq!(block.info(), r);
        assert_eq!(block.block, data[2 * BLOCK_LEN as usize..]);

        let bad = BlockInfo::new().index(0).begin(0).len(BLOCK_LEN + 1);
        remote.send(Message::Request(bad)).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while !peer.is_closing() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(torrent.num_peers(), 0);
        torrent.close();
    }

    #[tokio::test]
    async fn idle_pieces_are_cancelled_on_connections() {
        let data = data(4 * BLOCK_LEN as usize);
        let info = Info::new("t", 2 * BLOCK_LEN, None, &data).unwrap();
        let (torrent, _net) = torrent(Arc::new(MemoryTorrent::new(info)), None);
        torrent.set_piece_window(3);

        let (peer, mut remote) = seeder(&torrent, 2).await;
        fill_window(&torrent, &peer, 3).await;
        assert_eq!(torrent.pending_pieces().len(), 2);

        // still fresh
        torrent.expire_pieces(Instant::now()).await;
        assert_eq!(peer.in_flight(), 3);

        let later = Instant::now() + PIECE_EXPIRY + Duration::from_secs(1);
        torrent.expire_pieces(later).await;
        assert_eq!(peer.in_flight(), 0);
        assert!(torrent.pending_pieces().is_empty());

        let mut requested = Vec::new();
        let mut cancelled = Vec::new();
        timeout(Duration::from_secs(5), async {
            while cancelled.len() < 3 {
                match remote.next().await.unwrap().unwrap() {
                    Message::Request(r) => requested.push(r),
                    Message::Cancel(r) => cancelled.push(r),
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(requested.len(), 3);
        assert!(cancelled.iter().all(|c| requested.contains(c)));

        // the blocks can be asked again
        fill_window(&torrent, &peer, 3).await;
        torrent.close();
    }

    #[tokio::test]
    async fn wrong_metadata_starts_over() {
        // enough hashes for the dictionary to span two chunks
        let info = Info::new("t", 16, None, &data(16 * 1000)).unwrap();
        let raw = info.raw.clone();
        assert!(raw.len() > METADATA_PIECE_LEN);

        let storage = MemoryTorrent::empty(info.info_hash(), "t");
        let (torrent, _net) = torrent(Arc::new(storage), None);
        torrent.prepare_metadata(raw.len() as u32).unwrap();

        assert_eq!(torrent.next_metadata_request(), Some(0));
        assert_eq!(torrent.next_metadata_request(), Some(1));
        assert_eq!(torrent.next_metadata_request(), None);

        let mut wrong = raw.clone();
        let at = wrong.len() - 10;
        wrong[at] ^= 0xff;
        for (i, chunk) in wrong.chunks(METADATA_PIECE_LEN).enumerate() {
            torrent.put_info_slice(i as u32, chunk).await;
        }
        assert!(!torrent.ready());

        // every chunk is asked again, from the first one
        assert_eq!(torrent.next_metadata_request(), Some(0));
        assert_eq!(torrent.next_metadata_request(), Some(1));
        assert_eq!(torrent.next_metadata_request(), None);

        for (i, chunk) in raw.chunks(METADATA_PIECE_LEN).enumerate() {
            torrent.put_info_slice(i as u32, chunk).await;
        }
        assert!(torrent.ready());
        assert_eq!(torrent.num_pieces(), Some(1000));
    }
}
