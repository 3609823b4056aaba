use core::sync::atomic::{AtomicU8, Ordering};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::stage::Predicate;
use crate::task::Task;

const OPEN: u8 = 0;
const SEALED: u8 = 1;
const CLOSED: u8 = 2;

struct Subscriber<M> {
    name: Arc<str>,
    predicate: Predicate,
    tx: mpsc::UnboundedSender<M>,
}

struct Routing<M> {
    subscribers: Vec<Subscriber<M>>,
    /// Exact-tag index into `subscribers`.
    keyed: HashMap<String, Vec<usize>>,
    /// Subscribers whose predicate has to be evaluated on every publish.
    unkeyed: Vec<usize>,
}

/// Receiving end handed to a stage worker by [`BroadcastChannel::attach`].
pub struct Subscription<M> {
    pub name: Arc<str>,
    pub rx: mpsc::UnboundedReceiver<M>,
}

/// Multicast publish point with predicate-gated subscribers.
///
/// Every subscriber owns an unbounded FIFO queue created at attach time, so a
/// publish never blocks the publisher, never waits on a slow stage, and is
/// buffered even if the stage worker is not polling yet. Predicates run
/// synchronously inside `publish`; tag predicates are looked up through an
/// index keyed by stage-tag.
///
/// Lifecycle: `attach` is legal until [`seal`](Self::seal); after
/// [`close`](Self::close) every publish fails with `ChannelClosed`.
pub struct BroadcastChannel<M> {
    state: AtomicU8,
    routing: RwLock<Routing<M>>,
}

impl<M> Default for BroadcastChannel<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> BroadcastChannel<M> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(OPEN),
            routing: RwLock::new(Routing {
                subscribers: Vec::new(),
                keyed: HashMap::new(),
                unkeyed: Vec::new(),
            }),
        }
    }

    pub fn attach(&self, name: &str, predicate: Predicate) -> Result<Subscription<M>, RelayError> {
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(RelayError::AttachAfterStart {
                stage: name.to_string(),
            });
        }
        let mut routing = self
            .routing
            .write()
            .map_err(|_| RelayError::ChannelClosed)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(name);
        let index = routing.subscribers.len();
        match predicate.keys() {
            Some(keys) => {
                for key in keys {
                    routing.keyed.entry(key.to_string()).or_default().push(index);
                }
            }
            None => routing.unkeyed.push(index),
        }
        routing.subscribers.push(Subscriber {
            name: name.clone(),
            predicate,
            tx,
        });
        tracing::debug!("BroadcastChannel: attached `{}` as subscriber {}", name, index);

        Ok(Subscription { name, rx })
    }

    /// Ends the setup phase. Further attaches fail.
    pub fn seal(&self) {
        let _ = self
            .state
            .compare_exchange(OPEN, SEALED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Rejects further publishes and drops every subscriber queue's sender so
    /// workers drain what is already queued and then stop.
    pub fn close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        if let Ok(mut routing) = self.routing.write() {
            routing.subscribers.clear();
            routing.keyed.clear();
            routing.unkeyed.clear();
        }
        tracing::info!("BroadcastChannel: closed");
    }

    pub fn is_sealed(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    pub fn subscriber_count(&self) -> usize {
        self.routing.read().map(|r| r.subscribers.len()).unwrap_or(0)
    }
}

impl<M> BroadcastChannel<M>
where
    M: Clone + Borrow<Task>,
{
    /// Delivers `message` to every subscriber whose predicate matches.
    ///
    /// Returns how many subscribers received it. Zero is not an error: the
    /// message is dropped for every stage that does not care about it.
    pub fn publish(&self, message: M) -> Result<usize, RelayError> {
        if self.is_closed() {
            return Err(RelayError::ChannelClosed);
        }
        let routing = self.routing.read().map_err(|_| RelayError::ChannelClosed)?;
        let task: &Task = message.borrow();

        let keyed = routing
            .keyed
            .get(task.tag())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let candidates = merge_sorted(keyed, &routing.unkeyed);

        let mut delivered = 0;
        for index in candidates {
            let subscriber = &routing.subscribers[index];
            if !subscriber.predicate.matches(task) {
                continue;
            }
            if subscriber.tx.send(message.clone()).is_err() {
                tracing::debug!("BroadcastChannel: `{}` stopped receiving", subscriber.name);
                continue;
            }
            delivered += 1;
        }
        Ok(delivered)
    }
}

/// Merges two ascending index lists, keeping registration order.
fn merge_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out.dedup();
    out
}
