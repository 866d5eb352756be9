//! Single-flight coalescing for identical in-flight requests.
//!
//! Concurrent misses with the same (project, fingerprint) share one upstream
//! call: the first joiner becomes the leader and owns the producer; later
//! joiners follow the leader's output. Followers hold their own cursor into
//! the leader's frame buffer, so each one observes the full byte sequence in
//! order regardless of when it joined.
//!
//! The map is bounded. When full, the oldest flight is evicted from the map:
//! its existing followers keep following (they hold the shared state by Arc),
//! but new arrivals for that key re-enter the cache lookup path.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

use crate::api_types::Usage;

/// Default capacity of the coalescing map.
pub const DEFAULT_FLIGHT_CAPACITY: usize = 10_000;

/// Terminal outcome of a flight, shared with followers.
#[derive(Debug, Clone)]
pub struct FlightResult {
    pub canonical_response: serde_json::Value,
    pub usage: Option<Usage>,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightState {
    Pending,
    Done,
    Failed,
}

/// Watch payload: number of buffered frames plus the flight state.
type Progress = (usize, FlightState);

struct FlightShared {
    frames: RwLock<Vec<Bytes>>,
    result: RwLock<Option<Result<Arc<FlightResult>, String>>>,
    progress: watch::Sender<Progress>,
}

impl FlightShared {
    fn new() -> Self {
        let (progress, _) = watch::channel((0, FlightState::Pending));
        Self {
            frames: RwLock::new(Vec::new()),
            result: RwLock::new(None),
            progress,
        }
    }
}

/// Leader's handle on a flight. Completing or failing publishes the outcome
/// and closes the coalescing window; dropping the guard without either marks
/// the flight failed so followers never hang.
pub struct FlightGuard {
    shared: Arc<FlightShared>,
    registry: Option<(Arc<FlightMapInner>, FlightKey)>,
    finished: bool,
}

type FlightKey = (Uuid, String);

struct FlightMapInner {
    flights: DashMap<FlightKey, Arc<FlightShared>>,
    order: Mutex<VecDeque<FlightKey>>,
    capacity: usize,
}

impl FlightGuard {
    /// A follower view of this flight. The leader's own client response is
    /// served through one of these, so disconnects never tear down the
    /// producer.
    pub fn follower(&self) -> FlightFollower {
        FlightFollower {
            shared: self.shared.clone(),
        }
    }

    /// Append one output frame for followers.
    pub fn push_frame(&self, frame: Bytes) {
        self.shared.frames.write().push(frame);
        let count = self.shared.frames.read().len();
        self.shared
            .progress
            .send_replace((count, FlightState::Pending));
    }

    /// Publish the terminal result and close the window.
    pub fn complete(mut self, result: FlightResult) {
        *self.shared.result.write() = Some(Ok(Arc::new(result)));
        let count = self.shared.frames.read().len();
        self.shared.progress.send_replace((count, FlightState::Done));
        self.finished = true;
        self.deregister();
    }

    /// Publish a failure code and close the window.
    pub fn fail(mut self, code: impl Into<String>) {
        self.fail_inner(code.into());
        self.finished = true;
    }

    fn fail_inner(&mut self, code: String) {
        *self.shared.result.write() = Some(Err(code));
        let count = self.shared.frames.read().len();
        self.shared
            .progress
            .send_replace((count, FlightState::Failed));
        self.deregister();
    }

    fn deregister(&mut self) {
        if let Some((inner, key)) = self.registry.take() {
            inner.flights.remove(&key);
            inner.order.lock().retain(|k| k != &key);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.fail_inner("leader_aborted".to_string());
        }
    }
}

/// A follower's view of a flight.
#[derive(Clone)]
pub struct FlightFollower {
    shared: Arc<FlightShared>,
}

/// What a follower observed after waiting.
#[derive(Debug)]
pub enum FollowerOutcome {
    /// Leader finished; the shared result is available.
    Ready(Arc<FlightResult>),
    /// Leader failed with a stable error code.
    Failed(String),
    /// The wait deadline elapsed; the caller re-enters cache lookup.
    TimedOut,
}

impl FlightFollower {
    /// Wait for the leader's terminal state.
    pub async fn wait(&self, timeout: Duration) -> FollowerOutcome {
        let mut rx = self.shared.progress.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|(_, state)| *state != FlightState::Pending)
                .await
                .map(|p| p.1)
        })
        .await;

        match waited {
            Err(_) => FollowerOutcome::TimedOut,
            // A closed channel means the leader vanished without publishing.
            Ok(Err(_)) => FollowerOutcome::Failed("leader_aborted".to_string()),
            Ok(Ok(_)) => match self.shared.result.read().clone() {
                Some(Ok(result)) => FollowerOutcome::Ready(result),
                Some(Err(code)) => FollowerOutcome::Failed(code),
                None => FollowerOutcome::Failed("leader_aborted".to_string()),
            },
        }
    }

    /// Next frame at or after `cursor`, or `None` once the flight is done and
    /// the buffer is drained. Returns the frame and the next cursor.
    pub async fn next_frame(
        &self,
        cursor: usize,
        timeout: Duration,
    ) -> Result<Option<(Bytes, usize)>, FollowerOutcome> {
        {
            let frames = self.shared.frames.read();
            if cursor < frames.len() {
                return Ok(Some((frames[cursor].clone(), cursor + 1)));
            }
        }

        let mut rx = self.shared.progress.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|(count, state)| *count > cursor || *state != FlightState::Pending)
                .await
                .map(|p| *p)
        })
        .await;

        match waited {
            Err(_) => Err(FollowerOutcome::TimedOut),
            Ok(Err(_)) => Err(FollowerOutcome::Failed("leader_aborted".to_string())),
            Ok(Ok((count, state))) => {
                if cursor < count {
                    let frames = self.shared.frames.read();
                    Ok(Some((frames[cursor].clone(), cursor + 1)))
                } else {
                    match state {
                        FlightState::Done => Ok(None),
                        FlightState::Failed => match self.shared.result.read().clone() {
                            Some(Err(code)) => Err(FollowerOutcome::Failed(code)),
                            _ => Err(FollowerOutcome::Failed("leader_aborted".to_string())),
                        },
                        FlightState::Pending => Ok(None),
                    }
                }
            }
        }
    }
}

/// Join outcome: exactly one caller per key becomes the leader.
pub enum FlightJoin {
    Leader(FlightGuard),
    Follower(FlightFollower),
}

/// Bounded map of in-flight upstream calls.
pub struct FlightMap {
    inner: Arc<FlightMapInner>,
}

impl Default for FlightMap {
    fn default() -> Self {
        Self::new(DEFAULT_FLIGHT_CAPACITY)
    }
}

impl FlightMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FlightMapInner {
                flights: DashMap::new(),
                order: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Join the flight for `key`, becoming leader if none is in progress.
    pub fn join(&self, project_id: Uuid, fingerprint: &str) -> FlightJoin {
        let key = (project_id, fingerprint.to_string());

        if let Some(existing) = self.inner.flights.get(&key) {
            return FlightJoin::Follower(FlightFollower {
                shared: existing.clone(),
            });
        }

        // Bound the map: evict the oldest flight's registration. Its
        // followers keep their Arc; new arrivals for that key re-enter
        // the lookup path as fresh leaders.
        if self.inner.flights.len() >= self.inner.capacity {
            let evicted = self.inner.order.lock().pop_front();
            if let Some(old_key) = evicted {
                self.inner.flights.remove(&old_key);
                tracing::warn!(
                    project_id = %old_key.0,
                    "coalescing map full; evicted oldest flight"
                );
            }
        }

        let shared = Arc::new(FlightShared::new());
        match self.inner.flights.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                // Lost the race; follow the winner.
                FlightJoin::Follower(FlightFollower {
                    shared: existing.get().clone(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(shared.clone());
                self.inner.order.lock().push_back(key.clone());
                FlightJoin::Leader(FlightGuard {
                    shared,
                    registry: Some((self.inner.clone(), key)),
                    finished: false,
                })
            }
        }
    }

    /// A guard that never registers in the map, for callers that already
    /// waited out one coalescing window and must not wait again.
    pub fn solo(&self) -> FlightGuard {
        FlightGuard {
            shared: Arc::new(FlightShared::new()),
            registry: None,
            finished: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> FlightResult {
        FlightResult {
            canonical_response: serde_json::json!({"id": "chatcmpl-1"}),
            usage: None,
            provider: "openai".to_string(),
            model: "m-1".to_string(),
        }
    }

    #[tokio::test]
    async fn first_joiner_leads_second_follows() {
        let map = FlightMap::new(16);
        let project = Uuid::new_v4();

        let leader = match map.join(project, "fp") {
            FlightJoin::Leader(guard) => guard,
            FlightJoin::Follower(_) => panic!("expected leader"),
        };
        let follower = match map.join(project, "fp") {
            FlightJoin::Follower(f) => f,
            FlightJoin::Leader(_) => panic!("expected follower"),
        };

        leader.complete(result());
        match follower.wait(Duration::from_secs(1)).await {
            FollowerOutcome::Ready(r) => {
                assert_eq!(r.canonical_response["id"], "chatcmpl-1")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_closes_after_completion() {
        let map = FlightMap::new(16);
        let project = Uuid::new_v4();

        let FlightJoin::Leader(leader) = map.join(project, "fp") else {
            panic!("expected leader");
        };
        leader.complete(result());
        assert_eq!(map.in_flight(), 0);

        // Next joiner opens a fresh window as leader.
        assert!(matches!(map.join(project, "fp"), FlightJoin::Leader(_)));
    }

    #[tokio::test]
    async fn dropped_leader_fails_followers() {
        let map = FlightMap::new(16);
        let project = Uuid::new_v4();

        let FlightJoin::Leader(leader) = map.join(project, "fp") else {
            panic!("expected leader");
        };
        let FlightJoin::Follower(follower) = map.join(project, "fp") else {
            panic!("expected follower");
        };

        drop(leader);
        match follower.wait(Duration::from_secs(1)).await {
            FollowerOutcome::Failed(code) => assert_eq!(code, "leader_aborted"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn follower_times_out_when_leader_stalls() {
        let map = FlightMap::new(16);
        let project = Uuid::new_v4();

        let FlightJoin::Leader(_leader) = map.join(project, "fp") else {
            panic!("expected leader");
        };
        let FlightJoin::Follower(follower) = map.join(project, "fp") else {
            panic!("expected follower");
        };

        match follower.wait(Duration::from_millis(20)).await {
            FollowerOutcome::TimedOut => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn followers_replay_frames_from_the_start() {
        let map = FlightMap::new(16);
        let project = Uuid::new_v4();

        let FlightJoin::Leader(leader) = map.join(project, "fp") else {
            panic!("expected leader");
        };
        leader.push_frame(Bytes::from_static(b"one"));
        leader.push_frame(Bytes::from_static(b"two"));

        // Follower joins mid-stream and still sees frame 0 first.
        let FlightJoin::Follower(follower) = map.join(project, "fp") else {
            panic!("expected follower");
        };
        let (frame, cursor) = follower
            .next_frame(0, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"one"));
        let (frame, cursor) = follower
            .next_frame(cursor, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"two"));

        leader.push_frame(Bytes::from_static(b"three"));
        let (frame, cursor) = follower
            .next_frame(cursor, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"three"));

        leader.complete(result());
        assert!(
            follower
                .next_frame(cursor, Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn eviction_keeps_existing_followers_alive() {
        let map = FlightMap::new(1);
        let project = Uuid::new_v4();

        let FlightJoin::Leader(first_leader) = map.join(project, "fp-1") else {
            panic!("expected leader");
        };
        let FlightJoin::Follower(first_follower) = map.join(project, "fp-1") else {
            panic!("expected follower");
        };

        // Joining a second key evicts fp-1's registration.
        let FlightJoin::Leader(_second) = map.join(project, "fp-2") else {
            panic!("expected leader");
        };

        // New arrivals for fp-1 become leaders (the window is gone)...
        assert!(matches!(map.join(project, "fp-1"), FlightJoin::Leader(_)));

        // ...but the original follower still observes the original leader.
        first_leader.complete(result());
        assert!(matches!(
            first_follower.wait(Duration::from_secs(1)).await,
            FollowerOutcome::Ready(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_joins_elect_exactly_one_leader() {
        let map = Arc::new(FlightMap::new(64));
        let project = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let map = map.clone();
            handles.push(tokio::spawn(async move { map.join(project, "fp") }));
        }
        // Keep every join result alive while counting, so no guard drops
        // early and frees the key for a second leader.
        let joins = futures::future::join_all(handles).await;
        let leaders = joins
            .iter()
            .filter(|j| matches!(j.as_ref().unwrap(), FlightJoin::Leader(_)))
            .count();
        assert_eq!(leaders, 1);
    }
}
