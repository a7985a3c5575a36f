use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::api::indexed::IdIndexed;
use crate::api::message::RxMessage;
use crate::dialect::MavMessage;
use crate::wire::RawMessage;

/// The per-ID handler of a compiled routing table. Returning [None] means "this
///  pipe has no match for the message", which is distinct from returning an
///  empty list ("matched, produced nothing") - `or_else` depends on the
///  difference.
pub type Topic<T> = Arc<dyn Fn(&RawMessage) -> Option<Vec<T>> + Send + Sync>;

pub(crate) type MkTopics<T> = Box<dyn Fn() -> Topics<T> + Send + Sync>;

/// A node's compiled routing table: one topic per registered ID plus the
///  fallback for everything else.
pub(crate) struct Topics<T> {
    pub(crate) index: IdIndexed<Topic<T>>,
    pub(crate) other: Topic<T>,
}

/// The closed set of pipeline shapes. Leaves that need concrete types in scope
///  (raw passthrough, typed decode, flat-map, the stateful HA verifier) carry
///  their compile step as a closure built at construction time; the two merge
///  combinators hold their children structurally and compile by merging the
///  children's tables.
pub(crate) enum PipeNode<T: 'static> {
    Raw(MkTopics<T>),
    Decode(MkTopics<T>),
    FlatMap(MkTopics<T>),
    HighAvailability(MkTopics<T>),
    Union(Pipe<T>, Pipe<T>),
    OrElse(Pipe<T>, Pipe<T>),
}

impl<T> PipeNode<T> {
    fn name(&self) -> &'static str {
        match self {
            PipeNode::Raw(_) => "Raw",
            PipeNode::Decode(_) => "Decode",
            PipeNode::FlatMap(_) => "FlatMap",
            PipeNode::HighAvailability(_) => "HighAvailability",
            PipeNode::Union(_, _) => "Union",
            PipeNode::OrElse(_, _) => "OrElse",
        }
    }
}

struct PipeInner<T: 'static> {
    node: PipeNode<T>,
    topics: OnceCell<Topics<T>>,
}

/// A composable, immutable transformation from raw packets to lists of typed
///  values. Pipes are cheap handles (`Arc` inside); composition builds a new
///  node graph, and each node's routing table is compiled exactly once, on
///  first use, published safely across threads.
pub struct Pipe<T: 'static> {
    inner: Arc<PipeInner<T>>,
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Pipe {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for Pipe<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pipe<{}>", self.inner.node.name())
    }
}

/// Shortcut for the most common leaf: route one message type out of the raw
///  stream.
pub fn on<M: MavMessage>() -> Pipe<RxMessage<M>> {
    Pipe::raw().decode::<M>()
}

impl Pipe<RawMessage> {
    /// The seed of every pipeline: no routes, and every message falls through
    ///  the unmatched case unchanged.
    pub fn raw() -> Pipe<RawMessage> {
        Pipe::from_node(PipeNode::Raw(Box::new(|| Topics {
            index: IdIndexed::new(),
            other: Arc::new(|message| Some(vec![message.clone()])),
        })))
    }

    /// Routes this pipe's output for `M`'s registry ID into typed envelopes.
    pub fn decode<M: MavMessage>(&self) -> Pipe<RxMessage<M>> {
        let prev = self.clone();
        Pipe::from_node(PipeNode::Decode(Box::new(move || {
            let prev = prev.clone();
            let topic: Topic<RxMessage<M>> = Arc::new(move |message| {
                let values = prev.process(message);
                Some(values.into_iter().map(RxMessage::from_raw).collect())
            });

            let mut index = IdIndexed::new();
            index.insert(M::ID, topic);
            Topics {
                index,
                other: none_topic(),
            }
        })))
    }
}

impl<T: 'static> Pipe<T> {
    pub(crate) fn from_node(node: PipeNode<T>) -> Pipe<T> {
        Pipe {
            inner: Arc::new(PipeInner {
                node,
                topics: OnceCell::new(),
            }),
        }
    }

    pub(crate) fn topics(&self) -> &Topics<T> {
        self.inner.topics.get_or_init(|| self.compile())
    }

    fn compile(&self) -> Topics<T> {
        match &self.inner.node {
            PipeNode::Raw(mk)
            | PipeNode::Decode(mk)
            | PipeNode::FlatMap(mk)
            | PipeNode::HighAvailability(mk) => mk(),

            PipeNode::Union(left, right) => {
                let lt = left.topics();
                let rt = right.topics();

                let index = lt.index.merge(&rt.index, |a, b| {
                    let (a, b) = (a.clone(), b.clone());
                    let both: Topic<T> = Arc::new(move |m| {
                        union_null_safe(a.as_ref()(m), b.as_ref()(m))
                    });
                    both
                });
                let (a, b) = (lt.other.clone(), rt.other.clone());
                let other: Topic<T> = Arc::new(move |m| {
                    union_null_safe(a.as_ref()(m), b.as_ref()(m))
                });

                Topics { index, other }
            }

            PipeNode::OrElse(left, right) => {
                let lt = left.topics();
                let rt = right.topics();

                let index = lt.index.merge(&rt.index, |a, b| {
                    let (a, b) = (a.clone(), b.clone());
                    let biased: Topic<T> = Arc::new(move |m| {
                        a.as_ref()(m).or_else(|| b.as_ref()(m))
                    });
                    biased
                });
                let (a, b) = (lt.other.clone(), rt.other.clone());
                let other: Topic<T> = Arc::new(move |m| {
                    a.as_ref()(m).or_else(|| b.as_ref()(m))
                });

                Topics { index, other }
            }
        }
    }

    /// Runs the message through this node's routing table. [None] when neither
    ///  a per-ID route nor the fallback matched.
    pub fn process_opt(&self, message: &RawMessage) -> Option<Vec<T>> {
        let topics = self.topics();
        let topic = topics.index.get_or(message.msgid, &topics.other);
        topic.as_ref()(message)
    }

    /// Like [Self::process_opt], with "no match" collapsed to an empty list.
    pub fn process(&self, message: &RawMessage) -> Vec<T> {
        self.process_opt(message).unwrap_or_default()
    }

    /// Union of two pipes: a message ID registered on both sides invokes both
    ///  handlers and concatenates (left results first). The unmatched-ID
    ///  fallback is the null-safe union of both sides' fallbacks - [None] only
    ///  when both sides return [None].
    pub fn union(&self, that: &Pipe<T>) -> Pipe<T> {
        Pipe::from_node(PipeNode::Union(self.clone(), that.clone()))
    }

    /// Left-biased fallback: the right side is consulted only for IDs where the
    ///  left has no match at all. A left route that matched but produced an
    ///  empty list still wins.
    pub fn or_else(&self, that: &Pipe<T>) -> Pipe<T> {
        Pipe::from_node(PipeNode::OrElse(self.clone(), that.clone()))
    }

    /// Post-composes every route (and the fallback) with a flattening
    ///  transform, preserving the per-ID structure.
    pub fn select_many<T2: 'static>(
        &self,
        f: impl Fn(&RawMessage, T) -> Vec<T2> + Send + Sync + 'static,
    ) -> Pipe<T2> {
        self.select_many_arc(Arc::new(f))
    }

    pub(crate) fn select_many_arc<T2: 'static>(
        &self,
        f: Arc<dyn Fn(&RawMessage, T) -> Vec<T2> + Send + Sync>,
    ) -> Pipe<T2> {
        let prev = self.clone();
        Pipe::from_node(PipeNode::FlatMap(Box::new(move || {
            let pt = prev.topics();

            let mut index = IdIndexed::new();
            for (id, topic) in pt.index.iter() {
                let (topic, f) = (topic.clone(), f.clone());
                let mapped: Topic<T2> = Arc::new(move |m| {
                    topic.as_ref()(m)
                        .map(|vs| vs.into_iter().flat_map(|v| f.as_ref()(m, v)).collect())
                });
                index.insert(id, mapped);
            }

            let (o, f) = (pt.other.clone(), f.clone());
            let other: Topic<T2> = Arc::new(move |m| {
                o.as_ref()(m)
                    .map(|vs| vs.into_iter().flat_map(|v| f.as_ref()(m, v)).collect())
            });

            Topics { index, other }
        })))
    }

    pub fn select<T2: 'static>(
        &self,
        f: impl Fn(&RawMessage, T) -> T2 + Send + Sync + 'static,
    ) -> Pipe<T2> {
        self.select_many(move |m, v| vec![f(m, v)])
    }
}

fn none_topic<T>() -> Topic<T> {
    Arc::new(|_| None)
}

fn union_null_safe<T>(left: Option<Vec<T>>, right: Option<Vec<T>>) -> Option<Vec<T>> {
    match (left, right) {
        (None, None) => None,
        (Some(l), None) => Some(l),
        (None, Some(r)) => Some(r),
        (Some(mut l), Some(r)) => {
            l.extend(r);
            Some(l)
        }
    }
}
