use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};

use hashbrown::HashMap;
use tracing::{debug, warn};

use super::{Storage, TorrentStorage, TransferStats};
use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    metainfo::{Info, MetaInfo},
    status::FileStatus,
    torrent::InfoHash,
    wire::{Block, BlockInfo},
};

#[derive(Debug, Default)]
struct Data {
    info: Option<Arc<Info>>,
    bytes: Vec<u8>,
    bitfield: Option<Bitfield>,
    stats: TransferStats,
}

/// A torrent kept entirely in memory.
#[derive(Debug)]
pub struct MemoryTorrent {
    info_hash: InfoHash,
    name: String,
    data: RwLock<Data>,
    checking: AtomicBool,
}

fn lock_err<T>(_: T) -> Error {
    Error::Storage("poisoned lock".to_owned())
}

impl MemoryTorrent {
    pub fn empty(info_hash: InfoHash, name: &str) -> Self {
        Self {
            info_hash,
            name: name.to_owned(),
            data: RwLock::new(Data::default()),
            checking: AtomicBool::new(false),
        }
    }

    /// A torrent with no data yet.
    pub fn new(info: Info) -> Self {
        let torrent = Self::empty(info.info_hash(), &info.name);
        if let Ok(mut data) = torrent.data.write() {
            data.bytes = vec![0; info.total_length() as usize];
            data.bitfield = Some(Bitfield::from_piece(info.num_pieces() as usize));
            data.info = Some(Arc::new(info));
        }
        torrent
    }

    /// A torrent that already holds `bytes`, verified.
    pub fn with_data(info: Info, bytes: Vec<u8>) -> Result<Self, Error> {
        let torrent = Self::new(info);
        {
            let mut data = torrent.data.write().map_err(lock_err)?;
            if bytes.len() != data.bytes.len() {
                return Err(Error::Storage("data length mismatch".to_owned()));
            }
            data.bytes = bytes;
        }
        torrent.verify_all()?;
        Ok(torrent)
    }

    /// Everything stored so far.
    pub fn bytes(&self) -> Vec<u8> {
        self.data.read().map(|d| d.bytes.clone()).unwrap_or_default()
    }

    fn piece_ok(data: &Data, index: u32) -> bool {
        let Some(info) = &data.info else { return false };
        let (Some(size), Some(hash)) =
            (info.piece_size(index), info.piece_hash(index))
        else {
            return false;
        };
        let begin = index as usize * info.piece_length as usize;
        let Some(piece) = data.bytes.get(begin..begin + size as usize) else {
            return false;
        };
        sha1_smol::Sha1::from(piece).digest().bytes() == hash
    }
}

impl TorrentStorage for MemoryTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash.clone()
    }

    fn name(&self) -> String {
        self.data
            .read()
            .ok()
            .and_then(|d| d.info.as_ref().map(|i| i.name.clone()))
            .unwrap_or_else(|| self.name.clone())
    }

    fn meta_info(&self) -> Option<Arc<Info>> {
        self.data.read().ok()?.info.clone()
    }

    fn allocate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn verify_all(&self) -> Result<(), Error> {
        self.checking.store(true, Ordering::Relaxed);
        let mut data = self.data.write().map_err(lock_err)?;
        if let Some(info) = data.info.clone() {
            let mut bitfield = Bitfield::from_piece(info.num_pieces() as usize);
            for index in 0..info.num_pieces() {
                if Self::piece_ok(&data, index) {
                    bitfield.safe_set(index as usize);
                }
            }
            debug!("{:?} verified {} pieces", self.info_hash, bitfield.count_set());
            data.bitfield = Some(bitfield);
        }
        self.checking.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn checking(&self) -> bool {
        self.checking.load(Ordering::Relaxed)
    }

    fn put_chunk(&self, block: &Block) -> Result<(), Error> {
        let mut data = self.data.write().map_err(lock_err)?;
        let info = data.info.clone().ok_or(Error::Storage("no info".to_owned()))?;
        let offset = block.index as usize * info.piece_length as usize
            + block.begin as usize;
        let end = offset + block.block.len();
        if end > data.bytes.len() {
            return Err(Error::Storage("write out of bounds".to_owned()));
        }
        data.bytes[offset..end].copy_from_slice(&block.block);
        Ok(())
    }

    fn get_piece(&self, req: &BlockInfo) -> Result<Block, Error> {
        let data = self.data.read().map_err(lock_err)?;
        let info = data.info.clone().ok_or(Error::Storage("no info".to_owned()))?;
        if !data.bitfield.as_ref().is_some_and(|b| b.safe_get(req.index as usize)) {
            return Err(Error::Storage(format!("piece {} missing", req.index)));
        }
        let offset =
            req.index as usize * info.piece_length as usize + req.begin as usize;
        let end = offset + req.len as usize;
        let piece_end = req.index as usize * info.piece_length as usize
            + info.piece_size(req.index).unwrap_or(0) as usize;
        if end > piece_end {
            return Err(Error::Storage("read out of bounds".to_owned()));
        }
        Ok(Block {
            index: req.index,
            begin: req.begin,
            block: data.bytes[offset..end].to_vec(),
        })
    }

    fn verify_piece(&self, index: u32) -> Result<(), Error> {
        let mut data = self.data.write().map_err(lock_err)?;
        if !Self::piece_ok(&data, index) {
            warn!("{:?} piece {index} failed hash check", self.info_hash);
            return Err(Error::PieceInvalid);
        }
        if let Some(bitfield) = data.bitfield.as_mut() {
            bitfield.safe_set(index as usize);
        }
        Ok(())
    }

    fn bitfield(&self) -> Option<Bitfield> {
        self.data.read().ok()?.bitfield.clone()
    }

    fn download_remaining(&self) -> u64 {
        let Ok(data) = self.data.read() else { return 0 };
        let (Some(info), Some(bitfield)) = (&data.info, &data.bitfield) else {
            return 0;
        };
        (0..info.num_pieces())
            .filter(|i| !bitfield.safe_get(*i as usize))
            .filter_map(|i| info.piece_size(i))
            .map(u64::from)
            .sum()
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn delete(&self) -> Result<(), Error> {
        let mut data = self.data.write().map_err(lock_err)?;
        data.bytes.iter_mut().for_each(|b| *b = 0);
        if let Some(bitfield) = data.bitfield.as_mut() {
            bitfield.fill(false);
        }
        Ok(())
    }

    fn save_stats(&self, stats: &TransferStats) -> Result<(), Error> {
        self.data.write().map_err(lock_err)?.stats = *stats;
        Ok(())
    }

    fn stats(&self) -> TransferStats {
        self.data.read().map(|d| d.stats).unwrap_or_default()
    }

    fn file_list(&self) -> Vec<FileStatus> {
        let Ok(data) = self.data.read() else { return vec![] };
        let (Some(info), Some(bitfield)) = (&data.info, &data.bitfield) else {
            return vec![];
        };
        let piece_length = info.piece_length.max(1) as u64;

        info.file_spans()
            .into_iter()
            .map(|(name, offset, length)| {
                let first = offset / piece_length;
                let last = (offset + length).div_ceil(piece_length);
                let total = last.saturating_sub(first);
                let have = (first..last)
                    .filter(|i| bitfield.safe_get(*i as usize))
                    .count() as u64;
                let progress =
                    if total == 0 { 1.0 } else { have as f64 / total as f64 };
                FileStatus { name, length, progress }
            })
            .collect()
    }

    fn seed(&self) -> Result<bool, Error> {
        self.verify_all()?;
        Ok(self.bitfield().is_some_and(|b| b.completed()))
    }

    fn put_info(&self, bytes: &[u8]) -> Result<(), Error> {
        let info = Info::from_bytes(bytes)?;
        if info.info_hash() != self.info_hash {
            return Err(Error::MetadataRejected);
        }
        let mut data = self.data.write().map_err(lock_err)?;
        data.bytes = vec![0; info.total_length() as usize];
        data.bitfield = Some(Bitfield::from_piece(info.num_pieces() as usize));
        data.info = Some(Arc::new(info));
        Ok(())
    }
}

/// In memory [`Storage`], torrents opened twice share their data.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    torrents: Mutex<HashMap<InfoHash, Arc<MemoryTorrent>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a torrent that already has data.
    pub fn insert(&self, torrent: Arc<MemoryTorrent>) -> Result<(), Error> {
        self.torrents
            .lock()
            .map_err(lock_err)?
            .insert(torrent.info_hash(), torrent);
        Ok(())
    }

    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<MemoryTorrent>> {
        self.torrents.lock().ok()?.get(info_hash).cloned()
    }
}

impl Storage for MemoryStorage {
    fn empty_torrent(
        &self,
        info_hash: InfoHash,
        name: &str,
    ) -> Result<Arc<dyn TorrentStorage>, Error> {
        let mut torrents = self.torrents.lock().map_err(lock_err)?;
        let torrent = torrents
            .entry(info_hash.clone())
            .or_insert_with(|| Arc::new(MemoryTorrent::empty(info_hash, name)))
            .clone();
        Ok(torrent)
    }

    fn open_torrent(
        &self,
        meta_info: &MetaInfo,
    ) -> Result<Arc<dyn TorrentStorage>, Error> {
        let mut torrents = self.torrents.lock().map_err(lock_err)?;
        let info_hash = meta_info.info.info_hash();
        let torrent = torrents
            .entry(info_hash)
            .or_insert_with(|| Arc::new(MemoryTorrent::new(meta_info.info.clone())))
            .clone();
        Ok(torrent)
    }
}
