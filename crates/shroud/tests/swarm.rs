use std::{sync::Arc, time::Duration};

use bendy::encoding::ToBencode;
use futures::{future::BoxFuture, FutureExt};
use shroud::{
    config::Config,
    error::Error,
    metainfo::{Info, MetaInfo},
    network::{PeerAddr, TcpNetwork},
    storage::{MemoryStorage, MemoryTorrent, TorrentStorage},
    swarm::Swarm,
    torrent::{Torrent, TorrentState},
    tracker::{AnnounceRequest, AnnounceResponse, Announcer},
};
use tokio::time::{sleep, timeout};

/// Always answers with the same peer.
struct StaticTracker(PeerAddr);

impl Announcer for StaticTracker {
    fn name(&self) -> String {
        "static".to_owned()
    }

    fn announce(
        &self,
        _req: AnnounceRequest,
    ) -> BoxFuture<'_, Result<AnnounceResponse, Error>> {
        async move {
            Ok(AnnounceResponse {
                peers: vec![self.0.clone()],
                interval: Duration::from_secs(600),
                error: None,
            })
        }
        .boxed()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn data() -> Vec<u8> {
    (0..150_000u32).map(|i| (i * 7 % 253) as u8).collect()
}

async fn online_swarm(storage: Arc<MemoryStorage>) -> (Arc<Swarm>, PeerAddr) {
    let swarm = Swarm::new(storage, Config::default());
    let net = TcpNetwork::bind("127.0.0.1:0").await.unwrap();
    let addr = shroud::network::Network::addr(&net);
    swarm.obtained_network(Arc::new(net));

    let runner = swarm.clone();
    tokio::spawn(async move { runner.run().await });
    (swarm, addr)
}

/// A swarm seeding `info`, and its address.
async fn seeder(info: &Info) -> (Arc<Swarm>, PeerAddr) {
    let storage = Arc::new(MemoryStorage::new());
    let torrent = Arc::new(MemoryTorrent::with_data(info.clone(), data()).unwrap());
    storage.insert(torrent.clone()).unwrap();

    let (swarm, addr) = online_swarm(storage).await;
    swarm.add_torrent(torrent, &[]).unwrap();
    (swarm, addr)
}

async fn wait_started(torrent: &Torrent) {
    timeout(Duration::from_secs(5), async {
        while !torrent.started() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

async fn wait_done(torrent: &Torrent) {
    timeout(Duration::from_secs(60), async {
        while !torrent.done() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("download did not finish");
}

#[tokio::test]
async fn download_from_seeder() {
    init_tracing();
    let info = Info::new("blob", 32 * 1024, None, &data()).unwrap();
    let (seed, seed_addr) = seeder(&info).await;

    let storage = Arc::new(MemoryStorage::new());
    let leech_data = Arc::new(MemoryTorrent::new(info.clone()));
    storage.insert(leech_data.clone()).unwrap();
    let (leech, _) = online_swarm(storage).await;
    leech.add_open_tracker(Arc::new(StaticTracker(seed_addr)));

    let torrent = leech.add_torrent(leech_data.clone(), &[]).unwrap();
    wait_done(&torrent).await;

    assert_eq!(leech_data.bytes(), data());
    assert_eq!(leech_data.download_remaining(), 0);
    timeout(Duration::from_secs(5), async {
        while torrent.state() != TorrentState::Seeding {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    let status = leech.status();
    assert_eq!(status.torrents.len(), 1);
    assert!(status.torrents[0].downloaded >= data().len() as u64);

    leech.close().await;
    seed.close().await;
}

#[tokio::test]
async fn fetch_metadata_from_magnet() {
    init_tracing();
    let info = Info::new("magnetized", 16 * 1024, None, &data()).unwrap();
    let info_hash = info.info_hash();
    let (seed, seed_addr) = seeder(&info).await;

    let storage = Arc::new(MemoryStorage::new());
    let (leech, _) = online_swarm(storage.clone()).await;
    leech.add_open_tracker(Arc::new(StaticTracker(seed_addr)));

    let magnet = format!("magnet:?xt=urn:btih:{}&dn=magnetized", info_hash);
    let torrent = leech.add_remote_torrent(&magnet).await.unwrap();
    assert!(!torrent.ready());

    wait_done(&torrent).await;
    assert!(torrent.ready());
    assert_eq!(
        torrent.storage().meta_info().map(|i| i.name.clone()),
        Some("magnetized".to_owned())
    );
    assert_eq!(storage.get(&info_hash).unwrap().bytes(), data());

    leech.close().await;
    seed.close().await;
}

#[tokio::test]
async fn torrent_file_and_lifecycle() {
    init_tracing();
    let info = Info::new("from-file", 32 * 1024, None, &data()).unwrap();
    let info_hash = info.info_hash();
    let meta_info = MetaInfo {
        announce: None,
        announce_list: None,
        info,
    };
    let path = std::env::temp_dir().join(format!("shroud-{info_hash}.torrent"));
    tokio::fs::write(&path, meta_info.to_bencode().unwrap())
        .await
        .unwrap();

    let (swarm, _) = online_swarm(Arc::new(MemoryStorage::new())).await;
    let src = format!("file://{}", path.display());
    let torrent = swarm.add_remote_torrent(&src).await.unwrap();
    assert!(matches!(
        swarm.add_file_torrent(&path).await,
        Err(Error::NoDuplicateTorrent(_))
    ));

    wait_started(&torrent).await;
    assert_eq!(swarm.holder.active(), 1);

    // stopping drops the torrent, its data stays in storage
    swarm.stop(&info_hash).await.unwrap();
    assert!(matches!(torrent.stop().await, Err(Error::AlreadyStopped)));
    assert_eq!(swarm.holder.active(), 0);
    assert!(swarm.torrent_by_id(torrent.id).is_none());
    assert!(matches!(
        swarm.start(&info_hash),
        Err(Error::TorrentDoesNotExist)
    ));

    // and it can be added again
    let torrent = swarm.add_file_torrent(&path).await.unwrap();
    let _ = tokio::fs::remove_file(&path).await;
    wait_started(&torrent).await;
    assert_eq!(swarm.holder.active(), 1);

    swarm.remove(&info_hash).await.unwrap();
    assert!(swarm.torrent_by_id(torrent.id).is_none());
    assert_eq!(swarm.holder.active(), 0);
    assert!(matches!(
        swarm.remove(&info_hash).await,
        Err(Error::TorrentDoesNotExist)
    ));

    swarm.close().await;
}
