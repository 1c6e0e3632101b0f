//! A remote peer in the network that downloads and uploads data
pub mod session;
mod types;

// re-exports
pub use crate::status::PeerConnStats;
pub use types::*;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

use bendy::decoding::FromBencode;
use bytes::BytesMut;
use futures::StreamExt;
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    select,
    sync::mpsc,
    time::{interval, Instant},
};
use tokio_util::{
    codec::{Encoder, FramedRead},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    counter::Counter,
    error::Error,
    extensions::{
        Extension, ExtensionKind, Metadata, MetadataMsgType, Pex,
        HANDSHAKE_ID, METADATA_PIECE_LEN,
    },
    network::{BoxConn, PeerAddr},
    torrent::Torrent,
    utils::lock,
    wire::{Block, BlockInfo, ExtendedMessage, Message, MessageCodec},
};

use session::{
    CoreState, Session, COALESCE_THRESHOLD, FLUSH_INTERVAL,
    KEEP_ALIVE_INTERVAL, REQUEST_BACKOFF, SEND_QUEUE_LEN,
};

/// A connection to a remote peer of one torrent.
///
/// The receive loop and the send loop run on their own tasks, both end
/// when the connection is closed. The torrent keeps the connection in its
/// inbound or outbound map, and the connection only holds a weak
/// reference back to the torrent.
pub struct PeerConn {
    pub id: PeerId,
    pub addr: PeerAddr,
    pub direction: Direction,
    pub counter: Counter,
    torrent: Weak<Torrent>,
    /// Our extension table, `None` when the remote didn't set the
    /// extension bit.
    ours: Option<Extension>,
    session: Mutex<Session>,
    tx: mpsc::Sender<Message>,
    max_requests: AtomicUsize,
    closing: AtomicBool,
    cancel: CancellationToken,
}

impl PeerConn {
    pub fn new(
        torrent: Weak<Torrent>,
        addr: PeerAddr,
        id: PeerId,
        direction: Direction,
        ours: Option<Extension>,
        max_requests: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_LEN);
        let peer = Arc::new(Self {
            id,
            addr,
            direction,
            counter: Counter::new(),
            torrent,
            ours,
            session: Mutex::new(Session::default()),
            tx,
            max_requests: AtomicUsize::new(max_requests),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        (peer, rx)
    }

    /// Spawn the receive and send loops over `conn`.
    pub fn start(self: &Arc<Self>, conn: BoxConn, rx: mpsc::Receiver<Message>) {
        let (reader, writer) = tokio::io::split(conn);

        let peer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.read_loop(reader).await {
                debug!("{} read loop stopped: {e}", peer.addr);
            }
            peer.close();
        });

        let peer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.write_loop(writer, rx).await {
                debug!("{} write loop stopped: {e}", peer.addr);
            }
            peer.close();
        });
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Close the connection, its in flight requests go back to the piece
    /// tracker. Calling it again does nothing.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("{} closing connection", self.addr);
        self.cancel.cancel();

        let requests = lock(&self.session).take_downloading();
        if let Some(torrent) = self.torrent.upgrade() {
            for r in &requests {
                torrent.canceled_request(r);
            }
            torrent.remove_conn(self);
        }
    }

    /// Queue a message, waits while the send queue is full.
    pub async fn send(&self, msg: Message) {
        if self.is_closing() {
            return;
        }
        if self.tx.send(msg).await.is_err() {
            debug!("{} send queue is closed", self.addr);
        }
    }

    async fn read_loop(
        self: &Arc<Self>,
        reader: ReadHalf<BoxConn>,
    ) -> Result<(), Error> {
        let mut stream = FramedRead::new(reader, MessageCodec::default());

        loop {
            select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(Error::ConnectionClosed);
                    };
                    self.inbound(msg?).await?;
                }
            }
        }
    }

    async fn write_loop(
        &self,
        mut writer: WriteHalf<BoxConn>,
        mut rx: mpsc::Receiver<Message>,
    ) -> Result<(), Error> {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        let mut flush_interval = interval(FLUSH_INTERVAL);
        let mut last_send = Instant::now();

        loop {
            select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = flush_interval.tick() => {
                    if buf.is_empty()
                        && last_send.elapsed() >= KEEP_ALIVE_INTERVAL
                    {
                        trace!("{} > keepalive", self.addr);
                        codec.encode(Message::KeepAlive, &mut buf)?;
                    }
                    if !buf.is_empty() {
                        writer.write_all(&buf).await?;
                        writer.flush().await?;
                        buf.clear();
                        last_send = Instant::now();
                    }
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    let Some(msg) = self.filter_outbound(msg) else {
                        continue;
                    };

                    if let Message::Piece(block) = &msg {
                        let n = msg.len() as u64;
                        self.counter.record_upload(n);
                        if let Some(torrent) = self.torrent.upgrade() {
                            torrent.counter.record_upload(n);
                        }
                        trace!(
                            "{} > piece {} {} {}",
                            self.addr,
                            block.index,
                            block.begin,
                            block.block.len()
                        );
                    }

                    if msg.len() > COALESCE_THRESHOLD {
                        // large messages go out right away, after whatever
                        // was coalesced before them
                        if !buf.is_empty() {
                            writer.write_all(&buf).await?;
                            buf.clear();
                        }
                        let mut big = BytesMut::with_capacity(msg.len());
                        codec.encode(msg, &mut big)?;
                        writer.write_all(&big).await?;
                        writer.flush().await?;
                        last_send = Instant::now();
                        continue;
                    }

                    if buf.len() + msg.len() > COALESCE_THRESHOLD {
                        writer.write_all(&buf).await?;
                        writer.flush().await?;
                        buf.clear();
                        last_send = Instant::now();
                    }
                    codec.encode(msg, &mut buf)?;
                }
            }
        }
    }

    /// Drop messages that must not go out anymore.
    fn filter_outbound(&self, msg: Message) -> Option<Message> {
        match &msg {
            Message::Request(info) => {
                let choked = lock(&self.session).state.peer_choking;
                if choked {
                    debug!("{} choked us, dropping request {info:?}", self.addr);
                    self.cancel_download(info);
                    return None;
                }
            }
            Message::Piece(block) => {
                let queued =
                    lock(&self.session).queued_uploads.remove(&block.info());
                if !queued {
                    debug!(
                        "{} cancelled piece {} {}, not sending it",
                        self.addr, block.index, block.begin
                    );
                    return None;
                }
            }
            _ => {}
        }
        Some(msg)
    }

    /// Handle a message received from the peer.
    pub async fn inbound(self: &Arc<Self>, msg: Message) -> Result<(), Error> {
        let Some(torrent) = self.torrent.upgrade() else {
            return Err(Error::ConnectionClosed);
        };
        let addr = &self.addr;
        let size = msg.len() as u64;

        match msg {
            Message::KeepAlive => {
                trace!("{addr} < keepalive");
            }
            Message::Bitfield(bitfield) => {
                debug!("{addr} < bitfield");
                let first = lock(&self.session).bitfield.is_none();

                let Some(pieces) = torrent.num_pieces() else {
                    // we can't tell what the peer has before the info
                    // arrives, answer with an empty bitfield and ask for it
                    let empty = Bitfield::repeat(false, bitfield.len());
                    self.send(Message::Bitfield(empty)).await;
                    self.send_extension_handshake().await;
                    self.ask_next_metadata(&torrent).await;
                    return Ok(());
                };

                let remote =
                    Bitfield::from_bytes(bitfield.as_raw_slice(), pieces as usize);
                lock(&self.session).bitfield = Some(remote);
                self.check_interested(&torrent).await;

                if first {
                    self.unchoke().await;
                    self.send_extension_handshake().await;
                    lock(&self.session).run_download = true;
                }
            }
            Message::Choke => {
                debug!("{addr} < choke");
                lock(&self.session).state.peer_choking = true;
                self.cancel_pending_downloads().await;
            }
            Message::Unchoke => {
                debug!("{addr} < unchoke");
                lock(&self.session).state.peer_choking = false;
            }
            Message::Interested => {
                debug!("{addr} < interested");
                let announce = {
                    let mut session = lock(&self.session);
                    session.state.peer_interested = true;
                    !session.sent_interested
                };
                if announce {
                    self.check_interested(&torrent).await;
                    self.unchoke().await;
                }
            }
            Message::NotInterested => {
                debug!("{addr} < not interested");
                let announce = {
                    let mut session = lock(&self.session);
                    session.state.peer_interested = false;
                    !session.sent_interested
                };
                if announce {
                    self.check_interested(&torrent).await;
                }
            }
            Message::Have(index) => {
                trace!("{addr} < have {index}");
                let known = {
                    let mut session = lock(&self.session);
                    match session.bitfield.as_mut() {
                        Some(bitfield) => {
                            bitfield.safe_set(index as usize);
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    self.check_interested(&torrent).await;
                } else {
                    // nothing to compare against yet, our state is kept
                    debug!("{addr} > not interested");
                    self.send(Message::NotInterested).await;
                }
            }
            Message::Request(info) => {
                trace!("{addr} < request {info:?}");
                let choking = {
                    let mut session = lock(&self.session);
                    session.uploading = true;
                    session.state.am_choking
                };
                if choking {
                    debug!("{addr} requested while choked, dropping {info:?}");
                    return Ok(());
                }
                torrent.handle_piece_request(self, info).await;
            }
            Message::Piece(block) => {
                trace!(
                    "{addr} < piece {} {} {}",
                    block.index,
                    block.begin,
                    block.block.len()
                );
                let requested = lock(&self.session).complete_request(&block.info());
                if !requested {
                    debug!(
                        "{addr} sent piece {} {} we didn't ask for",
                        block.index, block.begin
                    );
                    return Ok(());
                }
                self.counter.record_download(size);
                torrent.counter.record_download(size);
                torrent.handle_piece_data(&block).await;
            }
            Message::Cancel(info) => {
                trace!("{addr} < cancel {info:?}");
                lock(&self.session).queued_uploads.remove(&info);
            }
            Message::Extended(ExtendedMessage(id, payload)) => {
                self.handle_extended(&torrent, id, &payload).await;
            }
        }

        Ok(())
    }

    async fn handle_extended(
        self: &Arc<Self>,
        torrent: &Arc<Torrent>,
        id: u8,
        payload: &[u8],
    ) {
        let addr = &self.addr;

        if id == HANDSHAKE_ID {
            match Extension::from_bencode(payload) {
                Ok(ext) => {
                    debug!("{addr} < extension handshake {:?}", ext.v);
                    lock(&self.session).extension = Some(ext);
                    if !torrent.ready() {
                        self.ask_next_metadata(torrent).await;
                    }
                }
                Err(e) => warn!("{addr} invalid extension handshake: {e}"),
            }
            return;
        }

        let kind = self
            .ours
            .as_ref()
            .map_or(ExtensionKind::Unknown, |ours| ours.kind_of(id));

        match kind {
            ExtensionKind::PeerExchange => match Pex::from_bytes(payload) {
                Ok(pex) => {
                    debug!(
                        "{addr} < pex added {} dropped {}",
                        pex.added.len(),
                        pex.dropped.len()
                    );
                    torrent.add_peers(pex.added);
                }
                Err(e) => warn!("{addr} invalid pex message: {e}"),
            },
            ExtensionKind::DhtRelay => {
                torrent.relay_dht(&self.id, payload.to_vec());
            }
            ExtensionKind::Metadata => {
                self.handle_metadata(torrent, payload).await;
            }
            ExtensionKind::Unknown => {
                warn!("{addr} sent extended message {id} we didn't advertise");
            }
        }
    }

    async fn handle_metadata(&self, torrent: &Torrent, payload: &[u8]) {
        let addr = &self.addr;
        let (msg, data) = match Metadata::extract(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("{addr} invalid metadata message: {e}");
                return;
            }
        };

        match msg.msg_type {
            MetadataMsgType::Data => {
                debug!("{addr} < metadata data {}", msg.piece);
                if torrent.ready() || msg.total_size.unwrap_or(0) == 0 {
                    return;
                }
                torrent.put_info_slice(msg.piece, data).await;
                self.ask_next_metadata(torrent).await;
            }
            MetadataMsgType::Reject => {
                debug!("{addr} < metadata reject {}", msg.piece);
                torrent.metadata_rejected(msg.piece);
            }
            MetadataMsgType::Request => {
                debug!("{addr} < metadata request {}", msg.piece);
                let Some(id) = self.their_id(ExtensionKind::Metadata) else {
                    return;
                };

                let reply = match torrent.metadata_bytes() {
                    Some(info) => {
                        let begin = msg.piece as usize * METADATA_PIECE_LEN;
                        if begin < info.len() {
                            let end = (begin + METADATA_PIECE_LEN).min(info.len());
                            Metadata::data(
                                msg.piece,
                                info.len() as u32,
                                &info[begin..end],
                            )
                        } else {
                            Metadata::reject(msg.piece)
                        }
                    }
                    None => Metadata::reject(msg.piece),
                };

                match reply {
                    Ok(buf) => self.send(ExtendedMessage(id, buf).into()).await,
                    Err(e) => warn!("{addr} failed to encode metadata reply: {e}"),
                }
            }
        }
    }

    /// Ask the peer for the next chunk of the info dictionary we still
    /// need.
    pub async fn ask_next_metadata(&self, torrent: &Torrent) {
        if torrent.ready() {
            return;
        }
        let (id, size) = {
            let session = lock(&self.session);
            let Some(ext) = &session.extension else { return };
            let Some(id) = ext.id_of(ExtensionKind::Metadata) else { return };
            (id, ext.metadata_size)
        };

        if let Some(size) = size {
            if let Err(e) = torrent.prepare_metadata(size) {
                warn!("{} advertised metadata of {size} bytes: {e}", self.addr);
                return;
            }
        }

        let Some(piece) = torrent.next_metadata_request() else {
            trace!("{} no metadata pieces to ask for", self.addr);
            return;
        };

        match Metadata::request(piece) {
            Ok(buf) => {
                debug!("{} > metadata request {piece}", self.addr);
                self.send(ExtendedMessage(id, buf).into()).await;
            }
            Err(e) => warn!("failed to encode metadata request: {e}"),
        }
    }

    async fn send_extension_handshake(&self) {
        let Some(ours) = &self.ours else { return };
        match ours.to_message() {
            Ok(msg) => {
                debug!("{} > extension handshake", self.addr);
                self.send(msg.into()).await;
            }
            Err(e) => warn!("failed to encode extension handshake: {e}"),
        }
    }

    /// Send the connected and disconnected peers of the torrent, if the
    /// remote speaks peer exchange.
    pub async fn send_pex(&self, pex: &Pex) {
        let Some(id) = self.their_id(ExtensionKind::PeerExchange) else {
            return;
        };
        match pex.to_bytes() {
            Ok(buf) => {
                trace!("{} > pex", self.addr);
                self.send(ExtendedMessage(id, buf).into()).await;
            }
            Err(e) => warn!("failed to encode pex: {e}"),
        }
    }

    /// Forward a relayed DHT payload to the peer.
    pub async fn send_dht(&self, payload: Vec<u8>) {
        if let Some(id) = self.their_id(ExtensionKind::DhtRelay) {
            self.send(ExtendedMessage(id, payload).into()).await;
        }
    }

    /// Id of `kind` in the table of the remote.
    fn their_id(&self, kind: ExtensionKind) -> Option<u8> {
        lock(&self.session).extension.as_ref()?.id_of(kind)
    }

    pub fn supports(&self, kind: ExtensionKind) -> bool {
        self.their_id(kind).is_some()
    }

    /// We're interested when the peer has a piece we don't.
    async fn check_interested(&self, torrent: &Torrent) {
        let local = torrent.bitfield();
        let interested = {
            let session = lock(&self.session);
            match (&local, &session.bitfield) {
                (Some(local), Some(remote)) => {
                    remote.xor(local).is_some_and(|diff| diff.any())
                }
                _ => false,
            }
        };
        self.set_interested(interested).await;
    }

    async fn set_interested(&self, interested: bool) {
        {
            let mut session = lock(&self.session);
            session.state.am_interested = interested;
            session.sent_interested = true;
        }
        if interested {
            debug!("{} > interested", self.addr);
            self.send(Message::Interested).await;
        } else {
            debug!("{} > not interested", self.addr);
            self.send(Message::NotInterested).await;
        }
    }

    async fn unchoke(&self) {
        let changed = {
            let mut session = lock(&self.session);
            std::mem::replace(&mut session.state.am_choking, false)
        };
        if changed {
            debug!("{} > unchoke", self.addr);
            self.send(Message::Unchoke).await;
        }
    }

    /// Drive the download on this connection, called on every torrent
    /// tick. Requests are queued until the window is full or the piece
    /// tracker has nothing for this peer.
    pub async fn tick_download(&self, torrent: &Torrent) {
        if self.is_closing() {
            return;
        }

        if torrent.done() {
            let fire = {
                let mut session = lock(&self.session);
                if !session.run_download || session.done_fired {
                    false
                } else {
                    session.done_fired = true;
                    session.state.am_interested = false;
                    true
                }
            };
            if fire {
                debug!("{} torrent is done, not interested anymore", self.addr);
                self.send(Message::NotInterested).await;
            }
            return;
        }

        loop {
            let (remote, last) = {
                let session = lock(&self.session);
                let state = session.state;
                if !session.run_download
                    || !(state.am_interested || state.peer_interested)
                    || state.peer_choking
                    || session.downloading.len() >= self.max_requests()
                    || Instant::now() < session.next_request_at
                {
                    return;
                }
                let Some(remote) = session.bitfield.clone() else { return };
                (remote, session.last_request)
            };

            if self.is_closing() {
                return;
            }

            match torrent.next_request(&remote, last.as_ref()) {
                Some(r) => self.queue_download(r).await,
                None => {
                    trace!("{} nothing to request, backing off", self.addr);
                    lock(&self.session).next_request_at =
                        Instant::now() + REQUEST_BACKOFF;
                    return;
                }
            }
        }
    }

    async fn queue_download(&self, r: BlockInfo) {
        {
            let mut session = lock(&self.session);
            session.last_request = Some(r);
            session.downloading.push(r);
        }
        trace!("{} > request {r:?}", self.addr);
        self.send(Message::Request(r)).await;
    }

    /// Forget an in flight request without telling the peer, its block
    /// goes back to the piece tracker.
    pub fn cancel_download(&self, info: &BlockInfo) {
        let removed = lock(&self.session).complete_request(info);
        if removed {
            if let Some(torrent) = self.torrent.upgrade() {
                torrent.canceled_request(info);
            }
        }
    }

    /// Cancel every in flight request, with the tracker and with the peer.
    pub async fn cancel_pending_downloads(&self) {
        let requests = lock(&self.session).take_downloading();
        if requests.is_empty() {
            return;
        }
        debug!("{} cancelling {} requests", self.addr, requests.len());

        let torrent = self.torrent.upgrade();
        for r in requests {
            if let Some(torrent) = &torrent {
                torrent.canceled_request(&r);
            }
            self.send(Message::Cancel(r)).await;
        }
    }

    /// Cancel the in flight requests of `index` with the peer, the piece
    /// tracker already reset them.
    pub async fn cancel_piece(&self, index: u32) {
        let requests = lock(&self.session).take_piece(index);
        for r in requests {
            self.send(Message::Cancel(r)).await;
        }
    }

    /// Queue a block for the peer, unless it cancels it first.
    pub async fn queue_upload(&self, block: Block) {
        lock(&self.session).queued_uploads.insert(block.info());
        self.send(Message::Piece(block)).await;
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests.load(Ordering::Relaxed)
    }

    pub fn set_max_requests(&self, n: usize) {
        self.max_requests.store(n, Ordering::Relaxed);
    }

    pub fn bitfield(&self) -> Option<Bitfield> {
        lock(&self.session).bitfield.clone()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        lock(&self.session).has_piece(index)
    }

    pub fn state(&self) -> CoreState {
        lock(&self.session).state
    }

    /// Number of requests waiting for an answer.
    pub fn in_flight(&self) -> usize {
        lock(&self.session).downloading.len()
    }

    pub fn stats(&self) -> PeerConnStats {
        let session = lock(&self.session);
        PeerConnStats {
            tx: self.counter.upload_rate(),
            rx: self.counter.download_rate(),
            id: self.id.escaped(),
            client: session
                .extension
                .as_ref()
                .and_then(|e| e.v.clone())
                .unwrap_or_default(),
            addr: self.addr.to_string(),
            us_interested: session.state.am_interested,
            us_choking: session.state.am_choking,
            them_interested: session.state.peer_interested,
            them_choking: session.state.peer_choking,
            downloading: !session.downloading.is_empty(),
            inbound: self.direction == Direction::Inbound,
            uploading: session.uploading,
            bitfield: session
                .bitfield
                .as_ref()
                .map(|b| b.as_raw_slice().to_vec())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::SinkExt;
    use tokio::{
        io::{duplex, DuplexStream},
        sync::watch,
        time::{sleep, timeout},
    };
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        config::Config,
        metainfo::Info,
        storage::{MemoryTorrent, TorrentStorage},
        torrent::TorrentParams,
        wire::BLOCK_LEN,
    };

    type Remote = Framed<DuplexStream, MessageCodec>;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    /// A torrent of two pieces of two blocks, and a connection to a remote
    /// driven by the test.
    async fn setup(window: usize) -> (Arc<Torrent>, Arc<PeerConn>, Remote) {
        let data = data(4 * BLOCK_LEN as usize);
        let info = Info::new("t", 2 * BLOCK_LEN, None, &data).unwrap();
        let storage: Arc<dyn TorrentStorage> = Arc::new(MemoryTorrent::new(info));
        let (_tx, net) = watch::channel(None);

        let config = Config { piece_window: window, ..Config::default() };
        let torrent = Torrent::new(TorrentParams {
            id: 1,
            storage,
            network: net,
            config,
            dht: None,
            hook: None,
        });

        let (local, remote) = duplex(1 << 20);
        let peer = torrent.attach(
            Box::new(local),
            PeerAddr::from("remote:1"),
            PeerId::generate(),
            Direction::Inbound,
            true,
        )
        .await;
        (torrent, peer, Framed::new(remote, MessageCodec::default()))
    }

    async fn wait_until(f: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !f() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn seeder_unchokes(torrent: &Torrent, peer: &PeerConn, remote: &mut Remote) {
        let mut all = Bitfield::from_piece(2);
        all.fill(true);
        remote.send(Message::Bitfield(all)).await.unwrap();
        remote.send(Message::Unchoke).await.unwrap();

        wait_until(|| !peer.state().peer_choking && peer.bitfield().is_some()).await;
        wait_until(|| lock(&peer.session).run_download).await;
        assert!(torrent.bitfield().is_some());
    }

    #[tokio::test]
    async fn choke_returns_in_flight_requests() {
        let (torrent, peer, mut remote) = setup(3).await;
        seeder_unchokes(&torrent, &peer, &mut remote).await;

        peer.tick_download(&torrent).await;
        assert_eq!(peer.in_flight(), 3);
        assert_eq!(torrent.pending_pieces().len(), 2);

        remote.send(Message::Choke).await.unwrap();
        wait_until(|| peer.in_flight() == 0).await;

        assert!(peer.state().peer_choking);
        assert!(torrent.pending_pieces().is_empty());
    }

    #[tokio::test]
    async fn unrequested_piece_is_dropped() {
        let (torrent, peer, mut remote) = setup(3).await;
        seeder_unchokes(&torrent, &peer, &mut remote).await;

        let block = Block { index: 0, begin: 0, block: vec![0; BLOCK_LEN as usize] };
        remote.send(Message::Piece(block)).await.unwrap();
        remote.send(Message::Have(1)).await.unwrap();
        remote.send(Message::KeepAlive).await.unwrap();

        // messages are handled in order, a cancel marks the end
        let probe = BlockInfo::new().index(1).begin(0).len(BLOCK_LEN);
        lock(&peer.session).queued_uploads.insert(probe);
        remote.send(Message::Cancel(probe)).await.unwrap();
        wait_until(|| lock(&peer.session).queued_uploads.is_empty()).await;

        assert_eq!(peer.counter.downloaded(), 0);
        assert!(torrent.pending_pieces().is_empty());
        assert_eq!(torrent.bitfield().map(|b| b.count_set()), Some(0));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (torrent, peer, mut remote) = setup(4).await;
        seeder_unchokes(&torrent, &peer, &mut remote).await;

        peer.tick_download(&torrent).await;
        assert_eq!(peer.in_flight(), 4);

        peer.close();
        peer.close();

        assert!(peer.is_closing());
        assert_eq!(peer.in_flight(), 0);
        assert!(torrent.pending_pieces().is_empty());
        assert_eq!(torrent.num_peers(), 0);
    }

    #[tokio::test]
    async fn have_before_bitfield_keeps_interest() {
        let (_torrent, peer, mut remote) = setup(3).await;
        lock(&peer.session).state.am_interested = true;

        remote.send(Message::Have(1)).await.unwrap();
        let reply = timeout(Duration::from_secs(5), async {
            loop {
                match remote.next().await.unwrap().unwrap() {
                    Message::Bitfield(_) | Message::KeepAlive => continue,
                    other => break other,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reply, Message::NotInterested);

        let session = lock(&peer.session);
        assert!(session.state.am_interested);
        assert!(!session.sent_interested);
        assert!(session.bitfield.is_none());
    }

    #[tokio::test]
    async fn request_while_choking_is_dropped() {
        let (_torrent, peer, mut remote) = setup(3).await;

        // no bitfield from the remote yet, so we still choke it
        let r = BlockInfo::new().index(0).begin(0).len(BLOCK_LEN);
        remote.send(Message::Request(r)).await.unwrap();
        wait_until(|| lock(&peer.session).uploading).await;

        assert!(peer.state().am_choking);
        assert!(lock(&peer.session).queued_uploads.is_empty());
    }
}
