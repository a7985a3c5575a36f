use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::indexed::IdIndexed;
use crate::api::message::RxMessage;
use crate::api::pipe::{Pipe, PipeNode, Topic, Topics};
use crate::dialect::MavMessage;
use crate::wire::{RawMessage, SignatureBlock};

/// Structural identity of a received message: the signature block (if the frame
///  was signed) plus a hash over payload, receive time and sender identity.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MsgKey {
    pub signature: Option<SignatureBlock>,
    pub hash: u64,
}

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn msg_key<M: MavMessage>(msg: &RxMessage<M>) -> MsgKey {
    let raw = msg.raw();
    let mut hasher = FxHasher::default();
    raw.payload.hash(&mut hasher);
    raw.rx_time.duration_since(*PROCESS_EPOCH).as_nanos().hash(&mut hasher);
    raw.sysid.hash(&mut hasher);
    raw.compid.hash(&mut hasher);

    MsgKey {
        signature: raw.signature.clone(),
        hash: hasher.finish(),
    }
}

struct CacheEntry {
    first_seen: Instant,
    from_left: bool,
    stale: bool,
}

/// Expiry queue slot. Carries the first-seen time alongside the key so a
///  lost-and-reseen key is never confused with the stale slot of its previous
///  incarnation.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd)]
struct QueueSlot {
    first_seen: Instant,
    key: MsgKey,
}

struct HaState {
    cache: FxHashMap<MsgKey, CacheEntry>,
    /// deadline-ordered (min-heap on first-seen time), so out-of-order receive
    ///  timestamps across the two channels cannot strand an expired entry
    ///  behind an unexpired one
    queue: BinaryHeap<Reverse<QueueSlot>>,
}

struct HaCore {
    stale_after: Duration,
    lost_after: Duration,
    state: Mutex<HaState>,
    warnings: AtomicU64,
    errors: AtomicU64,
}

impl HaCore {
    /// Handles one raw packet's worth of output from both channels under a
    ///  single lock acquisition. Returns [None] when nothing is forwarded.
    fn handle_channels<M: MavMessage>(
        &self,
        left: Option<Vec<RxMessage<M>>>,
        right: Option<Vec<RxMessage<M>>>,
    ) -> Option<Vec<RxMessage<M>>> {
        let mut out = Vec::new();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(messages) = left {
            self.handle(&mut state, messages, true, &mut out);
        }
        if let Some(messages) = right {
            self.handle(&mut state, messages, false, &mut out);
        }

        if out.is_empty() {
            None
        }
        else {
            Some(out)
        }
    }

    fn handle<M: MavMessage>(
        &self,
        state: &mut HaState,
        messages: Vec<RxMessage<M>>,
        from_left: bool,
        out: &mut Vec<RxMessage<M>>,
    ) {
        for msg in messages {
            self.sweep(state, msg.rx_time());

            let key = msg_key(&msg);
            if let Some(existing) = state.cache.get(&key) {
                if existing.from_left == from_left {
                    debug!("duplicate transmission of {:?} on the same channel", key);
                    self.errors.fetch_add(1, Ordering::SeqCst);
                }
                else {
                    // confirmed by the other channel: verification is silent
                    state.cache.remove(&key);
                }
                continue;
            }

            state.cache.insert(key.clone(), CacheEntry {
                first_seen: msg.rx_time(),
                from_left,
                stale: false,
            });
            state.queue.push(Reverse(QueueSlot {
                first_seen: msg.rx_time(),
                key,
            }));

            out.push(msg);
        }
    }

    /// Lazy expiry sweep, driven by receive timestamps rather than the wall
    ///  clock. Stops at the first live, unexpired entry.
    fn sweep(&self, state: &mut HaState, now: Instant) {
        loop {
            let slot = match state.queue.peek() {
                None => return,
                Some(Reverse(slot)) => slot.clone(),
            };

            let entry = match state.cache.get_mut(&slot.key) {
                // verified earlier, or the ghost of a lost-and-reseen key
                None => {
                    state.queue.pop();
                    continue;
                }
                Some(entry) if entry.first_seen != slot.first_seen => {
                    state.queue.pop();
                    continue;
                }
                Some(entry) => entry,
            };

            let age = now.duration_since(entry.first_seen);

            if age >= self.lost_after {
                warn!("message {:?} unconfirmed after {:?} - considering it lost", slot.key, self.lost_after);
                state.queue.pop();
                state.cache.remove(&slot.key);
                self.errors.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            if !entry.stale && age >= self.stale_after {
                debug!("message {:?} unconfirmed after {:?} - marking it stale", slot.key, self.stale_after);
                entry.stale = true;
                self.warnings.fetch_add(1, Ordering::SeqCst);
            }

            return;
        }
    }
}


/// Works like a union of two redundant channels, with a verification routine on
///  top:
///
/// * each logical message is expected to arrive on both channels in short
///   succession
/// * the first sighting is forwarded immediately and cached
/// * a second sighting from the *other* channel verifies the message silently
/// * a second sighting from the *same* channel is a double transmission and
///   counts as an error
/// * a cached message older than the stale threshold is flagged once as a
///   warning; older than the lost threshold it counts as an error and is
///   dropped from the cache
///
/// Unlike plain pipes this node is stateful; the state is serialized under a
///  single lock so both channels' threads can call [Self::process] concurrently.
pub struct HighAvailability<M: MavMessage> {
    pipe: Pipe<RxMessage<M>>,
    core: Arc<HaCore>,
}

impl<M: MavMessage> HighAvailability<M> {
    pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_millis(500);
    pub const DEFAULT_LOST_THRESHOLD: Duration = Duration::from_secs(2);

    pub fn new(left: Pipe<RxMessage<M>>, right: Pipe<RxMessage<M>>) -> HighAvailability<M> {
        Self::with_thresholds(
            left,
            right,
            Self::DEFAULT_STALE_THRESHOLD,
            Self::DEFAULT_LOST_THRESHOLD,
        )
    }

    pub fn with_thresholds(
        left: Pipe<RxMessage<M>>,
        right: Pipe<RxMessage<M>>,
        stale_after: Duration,
        lost_after: Duration,
    ) -> HighAvailability<M> {
        let core = Arc::new(HaCore {
            stale_after,
            lost_after,
            state: Mutex::new(HaState {
                cache: FxHashMap::default(),
                queue: BinaryHeap::new(),
            }),
            warnings: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        });

        let mk_core = core.clone();
        let pipe = Pipe::from_node(PipeNode::HighAvailability(Box::new(move || {
            let lt = left.topics();
            let rt = right.topics();

            let all_ids: FxHashSet<u32> = lt.index.keys().chain(rt.index.keys()).collect();

            let mut index = IdIndexed::new();
            for id in all_ids {
                let left_topic = lt.index.get(id).cloned();
                let right_topic = rt.index.get(id).cloned();
                let core = mk_core.clone();

                let topic: Topic<RxMessage<M>> = Arc::new(move |message| {
                    let left_messages = left_topic.as_ref().and_then(|t| t.as_ref()(message));
                    let right_messages = right_topic.as_ref().and_then(|t| t.as_ref()(message));
                    core.handle_channels(left_messages, right_messages)
                });
                index.insert(id, topic);
            }

            // the unmatched case routes through both children completely
            let other_left = left.clone();
            let other_right = right.clone();
            let other_core = mk_core.clone();
            let other: Topic<RxMessage<M>> = Arc::new(move |message| {
                other_core.handle_channels(
                    Some(other_left.process(message)),
                    Some(other_right.process(message)),
                )
            });

            Topics { index, other }
        })));

        HighAvailability { pipe, core }
    }

    /// the verifier as a pipe, e.g. for further composition or for a [crate::api::reader::Reader]
    pub fn pipe(&self) -> Pipe<RxMessage<M>> {
        self.pipe.clone()
    }

    pub fn process_opt(&self, message: &RawMessage) -> Option<Vec<RxMessage<M>>> {
        self.pipe.process_opt(message)
    }

    pub fn process(&self, message: &RawMessage) -> Vec<RxMessage<M>> {
        self.pipe.process(message)
    }

    pub fn warning_count(&self) -> u64 {
        self.core.warnings.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.core.errors.load(Ordering::SeqCst)
    }

    pub fn stale_after(&self) -> Duration {
        self.core.stale_after
    }

    pub fn lost_after(&self) -> Duration {
        self.core.lost_after
    }
}
