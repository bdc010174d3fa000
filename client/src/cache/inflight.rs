//! Single-flight registry for chunk downloads.
//!
//! The first reader of a missing chunk becomes the leader and fetches it;
//! readers arriving while the fetch runs subscribe to the leader's result.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::error::DriveError;

/// Identifies one chunk window of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub remote_id: String,
    pub start: u64,
}

impl ChunkKey {
    pub fn new(remote_id: &str, start: u64) -> Self {
        Self { remote_id: remote_id.to_string(), start }
    }
}

pub type FetchResult = Result<(), Arc<DriveError>>;

pub enum Attach<'a> {
    /// Fetch the chunk, then call [`LeaderGuard::complete`].
    Leader(LeaderGuard<'a>),
    /// Wait for the leader. A closed channel means the leader went away
    /// without a result and the caller should try again.
    Waiter(broadcast::Receiver<FetchResult>),
}

#[derive(Default)]
pub struct InFlight {
    entries: DashMap<ChunkKey, broadcast::Sender<FetchResult>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, key: &ChunkKey) -> Attach<'_> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => Attach::Waiter(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                vacant.insert(sender);
                Attach::Leader(LeaderGuard { inflight: self, key: key.clone(), finished: false })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Held by the leader. Dropping it without completing releases the key and
/// wakes waiters with a closed channel.
pub struct LeaderGuard<'a> {
    inflight: &'a InFlight,
    key: ChunkKey,
    finished: bool,
}

impl LeaderGuard<'_> {
    pub fn complete(mut self, result: FetchResult) {
        self.finished = true;
        if let Some((_, sender)) = self.inflight.entries.remove(&self.key) {
            // No receivers is fine.
            let _ = sender.send(result);
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.inflight.entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_attacher_waits_for_leader() {
        let inflight = InFlight::new();
        let key = ChunkKey::new("abc", 0);

        let leader = match inflight.attach(&key) {
            Attach::Leader(guard) => guard,
            Attach::Waiter(_) => panic!("first attach must lead"),
        };
        let mut waiter = match inflight.attach(&key) {
            Attach::Waiter(rx) => rx,
            Attach::Leader(_) => panic!("second attach must wait"),
        };
        assert_eq!(inflight.len(), 1);

        leader.complete(Ok(()));
        assert!(waiter.recv().await.unwrap().is_ok());
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn dropped_leader_closes_channel() {
        let inflight = InFlight::new();
        let key = ChunkKey::new("abc", 16);
        let leader = inflight.attach(&key);
        let mut waiter = match inflight.attach(&key) {
            Attach::Waiter(rx) => rx,
            Attach::Leader(_) => panic!("second attach must wait"),
        };
        drop(leader);
        assert!(waiter.recv().await.is_err());
        assert!(matches!(inflight.attach(&key), Attach::Leader(_)));
    }

    #[tokio::test]
    async fn failure_reaches_waiters() {
        let inflight = InFlight::new();
        let key = ChunkKey::new("gone", 0);
        let Attach::Leader(leader) = inflight.attach(&key) else {
            panic!("first attach must lead");
        };
        let Attach::Waiter(mut waiter) = inflight.attach(&key) else {
            panic!("second attach must wait");
        };
        leader.complete(Err(Arc::new(DriveError::NotFound("gone".into()))));
        let err = waiter.recv().await.unwrap().unwrap_err();
        assert!(err.duplicate().is_not_found());
    }
}
