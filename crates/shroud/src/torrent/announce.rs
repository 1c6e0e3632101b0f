//! Announce timing of one tracker of a torrent.

use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::{
    error::Error,
    network::PeerAddr,
    tracker::{AnnounceRequest, Announcer, Event, DEFAULT_INTERVAL},
};

/// Added to the next announce for every failure in a row.
pub const FAIL_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Schedule {
    next: Instant,
    fails: u32,
    /// The first announce went through.
    started: bool,
}

/// A tracker of a torrent, with its own schedule.
pub struct TorrentAnnounce {
    announcer: Arc<dyn Announcer>,
    schedule: Mutex<Schedule>,
}

impl TorrentAnnounce {
    pub fn new(announcer: Arc<dyn Announcer>) -> Self {
        Self {
            announcer,
            schedule: Mutex::new(Schedule {
                next: Instant::now(),
                fails: 0,
                started: false,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.announcer.name()
    }

    /// Announce right away on the next poll, as a first announce.
    pub async fn reset(&self) {
        let mut schedule = self.schedule.lock().await;
        schedule.next = Instant::now();
        schedule.started = false;
    }

    pub async fn should_announce(&self, now: Instant) -> bool {
        now >= self.schedule.lock().await.next
    }

    /// The event of a regular announce.
    pub async fn next_event(&self, done: bool) -> Event {
        let started = self.schedule.lock().await.started;
        match (started, done) {
            (false, false) => Event::Started,
            (_, true) => Event::Completed,
            (true, false) => Event::None,
        }
    }

    /// Announce and schedule the next one. The peers of the response are
    /// returned, none for a stopped announce.
    pub async fn try_announce(
        &self,
        req: AnnounceRequest,
    ) -> Result<Vec<PeerAddr>, Error> {
        let mut schedule = self.schedule.lock().await;
        let name = self.announcer.name();
        let event = req.event;

        debug!("{name} announcing {event:?}");
        let result = self.announcer.announce(req).await;
        let now = Instant::now();

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                schedule.failed(now);
                warn!("{name} announce failed: {e}");
                return Err(e);
            }
        };

        if let Some(reason) = resp.error {
            schedule.failed(now);
            warn!("{name} announce failed: {reason}");
            return Err(Error::Tracker(reason));
        }

        let interval = if resp.interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            resp.interval
        };
        schedule.next = now + interval + FAIL_BACKOFF * schedule.fails;
        schedule.fails = 0;
        schedule.started = true;
        debug!("{name} got {} peers, next in {interval:?}", resp.peers.len());

        if event == Event::Stopped {
            return Ok(Vec::new());
        }
        Ok(resp.peers)
    }
}

impl Schedule {
    fn failed(&mut self, now: Instant) {
        self.fails += 1;
        self.next = now + FAIL_BACKOFF * self.fails.max(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::{future::BoxFuture, FutureExt};

    use super::*;
    use crate::{
        peer::PeerId, torrent::InfoHash, tracker::AnnounceResponse,
    };

    struct Flaky {
        fail: AtomicBool,
    }

    impl Announcer for Flaky {
        fn name(&self) -> String {
            "flaky".to_owned()
        }

        fn announce(
            &self,
            _req: AnnounceRequest,
        ) -> BoxFuture<'_, Result<AnnounceResponse, Error>> {
            async move {
                if self.fail.load(Ordering::Relaxed) {
                    return Err(Error::Tracker("down".to_owned()));
                }
                Ok(AnnounceResponse {
                    peers: vec![PeerAddr::from("a:1")],
                    interval: Duration::from_secs(600),
                    error: None,
                })
            }
            .boxed()
        }
    }

    fn req(event: Event) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash([1; 20]),
            peer_id: PeerId([2; 20]),
            event,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            num_want: 10,
            port: 6881,
        }
    }

    #[tokio::test]
    async fn schedule_after_failures() {
        let flaky = Arc::new(Flaky { fail: AtomicBool::new(true) });
        let tracker = TorrentAnnounce::new(flaky.clone());
        assert_eq!(tracker.next_event(false).await, Event::Started);

        let before = Instant::now();
        assert!(tracker.try_announce(req(Event::Started)).await.is_err());
        assert!(tracker.try_announce(req(Event::Started)).await.is_err());
        {
            let schedule = tracker.schedule.lock().await;
            assert_eq!(schedule.fails, 2);
            assert!(schedule.next >= before + FAIL_BACKOFF * 2);
        }
        assert!(!tracker.should_announce(Instant::now()).await);

        flaky.fail.store(false, Ordering::Relaxed);
        let before = Instant::now();
        let peers = tracker.try_announce(req(Event::Started)).await.unwrap();
        assert_eq!(peers, vec![PeerAddr::from("a:1")]);
        {
            let schedule = tracker.schedule.lock().await;
            assert_eq!(schedule.fails, 0);
            // the failures still push this announce back
            assert!(
                schedule.next
                    >= before + Duration::from_secs(600) + FAIL_BACKOFF * 2
            );
        }
        assert_eq!(tracker.next_event(false).await, Event::None);
        assert_eq!(tracker.next_event(true).await, Event::Completed);

        let peers = tracker.try_announce(req(Event::Stopped)).await.unwrap();
        assert!(peers.is_empty());

        tracker.reset().await;
        assert!(tracker.should_announce(Instant::now()).await);
        assert_eq!(tracker.next_event(false).await, Event::Started);
    }
}
