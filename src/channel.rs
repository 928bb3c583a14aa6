use crate::model::{EvaluatorOptions, ExecId, ExecOptions, Response, ResponseKind, TabId};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Topic {
    CommandStart(TabId),
    CommandComplete(TabId),
    TerminalClear(TabId),
}

impl Topic {
    pub fn for_tab(tab: TabId) -> [Self; 3] {
        [
            Self::CommandStart(tab),
            Self::CommandComplete(tab),
            Self::TerminalClear(tab),
        ]
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandStart(tab) => write!(f, "command/start/fromuser/{tab}"),
            Self::CommandComplete(tab) => write!(f, "command/complete/fromuser/{tab}"),
            Self::TerminalClear(tab) => write!(f, "terminal/clear/{tab}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandStart {
    pub exec_id: ExecId,
    pub command: String,
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandComplete {
    pub exec_id: ExecId,
    pub response: Response,
    pub response_kind: ResponseKind,
    pub cancelled: bool,
    pub echo: bool,
    pub evaluator_options: EvaluatorOptions,
    pub exec_options: ExecOptions,
}

impl CommandComplete {
    pub fn cancellation(exec_id: ExecId) -> Self {
        Self {
            exec_id,
            response: Response::Bool(false),
            response_kind: ResponseKind::Scalar,
            cancelled: true,
            echo: true,
            evaluator_options: EvaluatorOptions::default(),
            exec_options: ExecOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Start(CommandStart),
    Complete(CommandComplete),
    Clear,
}

/// A message stamped with its position in the bus-wide publish order.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sequence: u64,
    pub topic: Topic,
    pub message: Message,
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ChannelError {
    #[error("event channel closed for topic {0}")]
    Closed(Topic),
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Envelope>,
}

#[derive(Debug, Default)]
struct ChannelInner {
    next_subscriber: AtomicU64,
    next_sequence: AtomicU64,
    topics: RwLock<HashMap<Topic, Vec<Subscriber>>>,
}

impl ChannelInner {
    fn unsubscribe(&self, topic: Topic, id: u64) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = topics.get_mut(&topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            topics.remove(&topic);
        }
        removed
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(Subscriber { id, sender });
        debug!(%topic, subscriber = id, "subscribed");

        Subscription {
            topic,
            id,
            receiver,
            channel: Arc::downgrade(&self.inner),
            released: false,
        }
    }

    pub fn publish_start(&self, tab: TabId, event: CommandStart) -> usize {
        self.publish(Topic::CommandStart(tab), Message::Start(event))
    }

    pub fn publish_complete(&self, tab: TabId, event: CommandComplete) -> usize {
        self.publish(Topic::CommandComplete(tab), Message::Complete(event))
    }

    pub fn publish_clear(&self, tab: TabId) -> usize {
        self.publish(Topic::TerminalClear(tab), Message::Clear)
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub fn topic_count(&self) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn publish(&self, topic: Topic, message: Message) -> usize {
        let topics = self
            .inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = topics.get(&topic) else {
            trace!(%topic, "published with no subscribers");
            return 0;
        };

        let envelope = Envelope {
            sequence: self.inner.next_sequence.fetch_add(1, Ordering::Relaxed),
            topic,
            message,
        };
        let delivered = subscribers
            .iter()
            .filter(|subscriber| subscriber.sender.send(envelope.clone()).is_ok())
            .count();
        trace!(%topic, delivered, "published");
        delivered
    }
}

/// Dropping the handle releases it, same as [`Subscription::release`].
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    channel: Weak<ChannelInner>,
    released: bool,
}

impl Subscription {
    /// Next queued message, `Ok(None)` when the queue is currently empty.
    pub fn try_next(&mut self) -> Result<Option<Envelope>, ChannelError> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Closed(self.topic)),
        }
    }

    pub fn release(mut self) -> bool {
        self.release_once()
    }

    fn release_once(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.receiver.close();

        let removed = self
            .channel
            .upgrade()
            .is_some_and(|inner| inner.unsubscribe(self.topic, self.id));
        debug!(topic = %self.topic, subscriber = self.id, removed, "unsubscribed");
        removed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_once();
    }
}
