//! In-process topic broker.
//!
//! [`InMemoryBroker`] implements the `courier-core` transport traits with the
//! AMQP semantics Courier relies on:
//!
//! - topic exchanges with `*` and `#` wildcards
//! - durable, exclusive and auto-delete queues
//! - round-robin manual-ack consumers; unacked messages are requeued when
//!   their consumer, channel or connection goes away
//!
//! Fault injection ([`fail_next_connects`](InMemoryBroker::fail_next_connects),
//! [`fail_next_publishes`](InMemoryBroker::fail_next_publishes),
//! [`sever_connections`](InMemoryBroker::sever_connections)) and inspection
//! helpers make reconnect and teardown behavior observable in tests.
//!
//! # Example
//!
//! ```
//! use courier_testing::InMemoryBroker;
//! use courier_core::broker::{Channel, Connection, Connector, QueueSpec};
//!
//! # async fn example() -> Result<(), courier_core::BrokerError> {
//! let broker = InMemoryBroker::new();
//! let channel = broker.connect().await?.create_channel().await?;
//! channel.declare_exchange("events_exchange").await?;
//! let queue = channel.declare_queue(&QueueSpec::durable("audit")).await?;
//! channel.bind_queue(&queue, "events_exchange", "User*").await?;
//!
//! broker.inject("events_exchange", "UserLogin", b"{}".to_vec())?;
//! assert_eq!(broker.message_count("audit"), 0); // `*` matches a whole word only
//! # Ok(())
//! # }
//! ```

use courier_core::broker::{
    Acknowledger, BrokerError, BrokerFuture, Channel, Connection, Connector, Delivery,
    DeliveryStream, QueueSpec,
};
use futures::Stream;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

type Shared = Arc<Mutex<State>>;

/// In-memory broker shared by every connection it hands out.
///
/// Cloning is cheap; clones observe and control the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Shared,
}

#[derive(Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    connect_attempts: usize,
    publish_attempts: usize,
    failing_connects: usize,
    failing_publishes: usize,
}

struct ChannelState {
    connection: u64,
    open: bool,
}

struct Queue {
    owner: Option<u64>,
    auto_delete: bool,
    bindings: Vec<(String, String)>,
    ready: VecDeque<Message>,
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    message: Message,
    consumer: u64,
}

struct ConsumerSlot {
    id: u64,
    channel: u64,
    cancelled: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.open)
    }

    fn route(&mut self, shared: &Shared, exchange: &str, routing_key: &str, body: &[u8]) -> usize {
        let targets: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue
                    .bindings
                    .iter()
                    .any(|(ex, pattern)| ex == exchange && topic_matches(pattern, routing_key))
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
            self.pump(shared, name);
        }
        targets.len()
    }

    /// Hand ready messages to consumers, round-robin.
    fn pump(&mut self, shared: &Shared, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = queue.next_consumer.wrapping_add(1);
            let slot = &queue.consumers[index];

            self.next_id += 1;
            let tag = self.next_id;
            let delivery = Delivery::new(
                message.routing_key.clone(),
                message.body.clone(),
                message.redelivered,
                Box::new(InMemoryAcker {
                    shared: Arc::downgrade(shared),
                    queue: queue_name.to_string(),
                    tag,
                }),
            );

            if slot.sender.send(Ok(delivery)).is_ok() {
                queue.unacked.insert(
                    tag,
                    Unacked {
                        message,
                        consumer: slot.id,
                    },
                );
            } else {
                slot.cancelled.store(true, Ordering::SeqCst);
                queue.consumers.remove(index);
                queue.ready.push_front(message);
            }
        }
    }

    fn cancel_consumer(&mut self, shared: &Shared, queue_name: &str, consumer: u64) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let Some(index) = queue.consumers.iter().position(|c| c.id == consumer) else {
            return;
        };
        let slot = queue.consumers.remove(index);
        slot.cancelled.store(true, Ordering::SeqCst);

        let tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        if queue.auto_delete && queue.consumers.is_empty() {
            self.delete_queue(queue_name);
        } else {
            self.pump(shared, queue_name);
        }
    }

    fn delete_queue(&mut self, queue_name: &str) {
        if let Some(queue) = self.queues.remove(queue_name) {
            for slot in queue.consumers {
                slot.cancelled.store(true, Ordering::SeqCst);
            }
        }
    }

    fn close_channel(&mut self, shared: &Shared, channel: u64) {
        match self.channels.get_mut(&channel) {
            Some(state) if state.open => state.open = false,
            _ => return,
        }

        let consumers: Vec<(String, u64)> = self
            .queues
            .iter()
            .flat_map(|(name, queue)| {
                queue
                    .consumers
                    .iter()
                    .filter(|c| c.channel == channel)
                    .map(move |c| (name.clone(), c.id))
            })
            .collect();
        for (queue, consumer) in consumers {
            self.cancel_consumer(shared, &queue, consumer);
        }
    }

    fn close_connection(&mut self, shared: &Shared, connection: u64) {
        match self.connections.get_mut(&connection) {
            Some(open) if *open => *open = false,
            _ => return,
        }

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(shared, channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// AMQP topic matching: words are separated by `.`, `*` matches exactly one
/// word and `#` matches zero or more.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.shared)
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state().failing_connects = n;
    }

    /// Make the next `n` publishes fail without closing their channel.
    pub fn fail_next_publishes(&self, n: usize) {
        self.state().failing_publishes = n;
    }

    /// Close every open connection as if the broker had dropped them.
    ///
    /// Consumers are cancelled (their streams end), unacked messages are
    /// requeued and exclusive queues are deleted before this returns.
    pub fn sever_connections(&self) {
        let mut state = self.state();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, open)| **open)
            .map(|(id, _)| *id)
            .collect();
        for connection in open {
            state.close_connection(&self.shared, connection);
        }
    }

    /// Publish directly to an exchange, bypassing any connection.
    ///
    /// Returns the number of queues the message was routed to.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the exchange does not exist.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<usize, BrokerError> {
        let mut state = self.state();
        if !state.exchanges.contains(exchange) {
            return Err(no_exchange(exchange, routing_key));
        }
        Ok(state.route(&self.shared, exchange, routing_key, &body))
    }

    /// Bind a queue directly, bypassing any connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] if the queue or exchange is missing.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        bind(&mut self.state(), queue, exchange, routing_key)
    }

    /// Wait until `queue` has at least `n` consumers.
    pub async fn wait_for_consumers(&self, queue: &str, n: usize) {
        while self.consumer_count(queue) < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Number of connection attempts so far, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    /// Number of publish attempts so far, failed ones included.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.state().publish_attempts
    }

    /// Number of declared exchanges.
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.state().exchanges.len()
    }

    /// Number of existing queues.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    /// Whether `queue` currently exists.
    #[must_use]
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Active consumers on `queue` (0 if it does not exist).
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting for a consumer on `queue`.
    #[must_use]
    pub fn message_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }
}

fn no_exchange(exchange: &str, routing_key: &str) -> BrokerError {
    BrokerError::PublishFailed {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        reason: format!("no exchange '{exchange}'"),
    }
}

fn bind(state: &mut State, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
    if !state.exchanges.contains(exchange) {
        return Err(BrokerError::Topology {
            object: exchange.to_string(),
            reason: "no such exchange".to_string(),
        });
    }
    let Some(target) = state.queues.get_mut(queue) else {
        return Err(BrokerError::Topology {
            object: queue.to_string(),
            reason: "no such queue".to_string(),
        });
    };
    let binding = (exchange.to_string(), routing_key.to_string());
    if !target.bindings.contains(&binding) {
        target.bindings.push(binding);
    }
    Ok(())
}

impl Connector for InMemoryBroker {
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn Connection>> {
        let result = {
            let mut state = self.state();
            state.connect_attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                Err(BrokerError::ConnectionFailed(
                    "connection refused (injected)".to_string(),
                ))
            } else {
                let id = state.next_id();
                state.connections.insert(id, true);
                Ok(Arc::new(InMemoryConnection {
                    shared: Arc::clone(&self.shared),
                    id,
                }) as Arc<dyn Connection>)
            }
        };
        Box::pin(std::future::ready(result))
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

struct InMemoryConnection {
    shared: Shared,
    id: u64,
}

impl Connection for InMemoryConnection {
    fn is_open(&self) -> bool {
        lock(&self.shared).connections.get(&self.id).copied().unwrap_or(false)
    }

    fn create_channel(&self) -> BrokerFuture<'_, Arc<dyn Channel>> {
        let result = {
            let mut state = lock(&self.shared);
            if state.connections.get(&self.id).copied().unwrap_or(false) {
                let id = state.next_id();
                state.channels.insert(
                    id,
                    ChannelState {
                        connection: self.id,
                        open: true,
                    },
                );
                Ok(Arc::new(InMemoryChannel {
                    shared: Arc::clone(&self.shared),
                    id,
                    connection: self.id,
                }) as Arc<dyn Channel>)
            } else {
                Err(BrokerError::ChannelClosed("connection is closed".to_string()))
            }
        };
        Box::pin(std::future::ready(result))
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        lock(&self.shared).close_connection(&self.shared, self.id);
        Box::pin(std::future::ready(Ok(())))
    }
}

struct InMemoryChannel {
    shared: Shared,
    id: u64,
    connection: u64,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = lock(&self.shared);
        if state.channel_open(self.id) {
            Ok(state)
        } else {
            Err(BrokerError::ChannelClosed(format!("channel {} is closed", self.id)))
        }
    }
}

impl Channel for InMemoryChannel {
    fn is_open(&self) -> bool {
        lock(&self.shared).channel_open(self.id)
    }

    fn declare_exchange(&self, name: &str) -> BrokerFuture<'_, ()> {
        let result = self.open_state().map(|mut state| {
            state.exchanges.insert(name.to_string());
        });
        Box::pin(std::future::ready(result))
    }

    fn declare_queue(&self, spec: &QueueSpec) -> BrokerFuture<'_, String> {
        let result = self.open_state().and_then(|mut state| {
            let name = match &spec.name {
                Some(name) => name.clone(),
                None => format!("amq.gen-{}", state.next_id()),
            };
            match state.queues.get(&name) {
                Some(existing) if existing.owner.is_some_and(|o| o != self.connection) => {
                    Err(BrokerError::Topology {
                        object: name,
                        reason: "queue is exclusive to another connection".to_string(),
                    })
                }
                Some(_) => Ok(name),
                None => {
                    state.queues.insert(
                        name.clone(),
                        Queue {
                            owner: spec.exclusive.then_some(self.connection),
                            auto_delete: spec.auto_delete,
                            bindings: Vec::new(),
                            ready: VecDeque::new(),
                            unacked: BTreeMap::new(),
                            consumers: Vec::new(),
                            next_consumer: 0,
                        },
                    );
                    Ok(name)
                }
            }
        });
        Box::pin(std::future::ready(result))
    }

    fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerFuture<'_, ()> {
        let result = self
            .open_state()
            .and_then(|mut state| bind(&mut state, queue, exchange, routing_key));
        Box::pin(std::future::ready(result))
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerFuture<'_, ()> {
        let result = self.open_state().and_then(|mut state| {
            state.publish_attempts += 1;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BrokerError::PublishFailed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reason: "publish not confirmed (injected)".to_string(),
                });
            }
            if !state.exchanges.contains(exchange) {
                return Err(no_exchange(exchange, routing_key));
            }
            state.route(&self.shared, exchange, routing_key, body);
            Ok(())
        });
        Box::pin(std::future::ready(result))
    }

    fn consume(&self, queue: &str) -> BrokerFuture<'_, DeliveryStream> {
        let result = self.open_state().and_then(|mut state| {
            let consumer = state.next_id();
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: "no such queue".to_string(),
                });
            };
            if target.owner.is_some_and(|o| o != self.connection) {
                return Err(BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    reason: "queue is exclusive to another connection".to_string(),
                });
            }

            let (sender, receiver) = mpsc::unbounded_channel();
            let cancelled = Arc::new(AtomicBool::new(false));
            target.consumers.push(ConsumerSlot {
                id: consumer,
                channel: self.id,
                cancelled: Arc::clone(&cancelled),
                sender,
            });
            state.pump(&self.shared, queue);

            Ok(Box::pin(ConsumerStream {
                shared: Arc::downgrade(&self.shared),
                queue: queue.to_string(),
                consumer,
                cancelled,
                receiver,
            }) as DeliveryStream)
        });
        Box::pin(std::future::ready(result))
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        lock(&self.shared).close_channel(&self.shared, self.id);
        Box::pin(std::future::ready(Ok(())))
    }
}

/// Deliveries for one consumer; dropping it cancels the consumer.
struct ConsumerStream {
    shared: Weak<Mutex<State>>,
    queue: String,
    consumer: u64,
    cancelled: Arc<AtomicBool>,
    receiver: mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>,
}

impl Stream for ConsumerStream {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled.load(Ordering::SeqCst) {
            // Anything still buffered has been requeued already.
            return Poll::Ready(None);
        }
        this.receiver.poll_recv(cx)
    }
}

impl Drop for ConsumerStream {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared).cancel_consumer(&shared, &self.queue, self.consumer);
        }
    }
}

struct InMemoryAcker {
    shared: Weak<Mutex<State>>,
    queue: String,
    tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), BrokerError> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| BrokerError::Acknowledgement("broker is gone".to_string()))?;
        let mut state = lock(&shared);
        let unacked = state
            .queues
            .get_mut(&self.queue)
            .and_then(|queue| queue.unacked.remove(&self.tag))
            .ok_or_else(|| {
                BrokerError::Acknowledgement(format!("unknown delivery tag {}", self.tag))
            })?;

        if requeue {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.ready.push_front(message);
            }
            state.pump(&shared, &self.queue);
        }
        Ok(())
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(std::future::ready(self.settle(false)))
    }

    fn reject(&self, requeue: bool) -> BrokerFuture<'_, ()> {
        Box::pin(std::future::ready(self.settle(requeue)))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use proptest::prelude::*;

    const EXCHANGE: &str = "events_exchange";

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        let channel = broker
            .connect()
            .await
            .expect("connect")
            .create_channel()
            .await
            .expect("channel");
        channel.declare_exchange(EXCHANGE).await.expect("exchange");
        channel
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("UserLogin", "UserLogin"));
        assert!(!topic_matches("UserLogin", "UserLoginSuccess"));
        assert!(topic_matches("user.*", "user.login"));
        assert!(!topic_matches("user.*", "user.login.failed"));
        assert!(topic_matches("user.#", "user"));
        assert!(topic_matches("user.#", "user.login.failed"));
        assert!(topic_matches("#.failed", "user.login.failed"));
        assert!(!topic_matches("*.failed", "user.login.failed"));
    }

    proptest! {
        #[test]
        fn hash_matches_everything(key in "[a-z]{1,5}(\\.[a-z]{1,5}){0,4}") {
            prop_assert!(topic_matches("#", &key));
            prop_assert!(topic_matches(&key, &key));
        }
    }

    #[tokio::test]
    async fn routes_by_binding_and_round_robins_consumers() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let queue = channel
            .declare_queue(&QueueSpec::durable("work"))
            .await
            .expect("queue");
        channel.bind_queue(&queue, EXCHANGE, "GetProfile").await.expect("bind");

        let mut first = channel.consume(&queue).await.expect("consume");
        let mut second = channel.consume(&queue).await.expect("consume");

        assert_eq!(broker.inject(EXCHANGE, "UserLogin", b"x".to_vec()).expect("inject"), 0);
        broker.inject(EXCHANGE, "GetProfile", b"1".to_vec()).expect("inject");
        broker.inject(EXCHANGE, "GetProfile", b"2".to_vec()).expect("inject");

        let a = first.next().await.expect("one").expect("ok");
        let b = second.next().await.expect("two").expect("ok");
        assert_eq!((a.body.as_slice(), b.body.as_slice()), (&b"1"[..], &b"2"[..]));
        assert_eq!(broker.unacked_count(&queue), 2);

        a.ack().await.expect("ack");
        b.ack().await.expect("ack");
        assert_eq!(broker.unacked_count(&queue), 0);
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered_when_the_channel_closes() {
        let broker = InMemoryBroker::new();
        let first = channel(&broker).await;
        let queue = first
            .declare_queue(&QueueSpec::durable("work"))
            .await
            .expect("queue");
        first.bind_queue(&queue, EXCHANGE, "GetProfile").await.expect("bind");
        let mut deliveries = first.consume(&queue).await.expect("consume");

        broker.inject(EXCHANGE, "GetProfile", b"1".to_vec()).expect("inject");
        let pending = deliveries.next().await.expect("one").expect("ok");
        assert!(!pending.redelivered);

        first.close().await.expect("close");
        assert!(deliveries.next().await.is_none());
        assert!(pending.ack().await.is_err());
        assert_eq!(broker.message_count(&queue), 1);

        let second = channel(&broker).await;
        let mut again = second.consume(&queue).await.expect("consume");
        let redelivered = again.next().await.expect("one").expect("ok");
        assert!(redelivered.redelivered);
        redelivered.reject(false).await.expect("reject");
        assert_eq!(broker.message_count(&queue), 0);
    }

    #[tokio::test]
    async fn ephemeral_queue_goes_away_with_its_consumer() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let queue = channel
            .declare_queue(&QueueSpec::ephemeral())
            .await
            .expect("queue");
        assert!(queue.starts_with("amq.gen-"));

        let deliveries = channel.consume(&queue).await.expect("consume");
        assert_eq!(broker.consumer_count(&queue), 1);

        drop(deliveries);
        assert!(!broker.queue_exists(&queue));
        assert_eq!(broker.queue_count(), 0);
    }

    #[tokio::test]
    async fn exclusive_queues_belong_to_their_connection() {
        let broker = InMemoryBroker::new();
        let owner = channel(&broker).await;
        let queue = owner
            .declare_queue(&QueueSpec::ephemeral())
            .await
            .expect("queue");

        let other = channel(&broker).await;
        assert!(matches!(
            other.consume(&queue).await,
            Err(BrokerError::ConsumeFailed { .. })
        ));

        broker.sever_connections();
        assert!(!broker.queue_exists(&queue));
        assert!(!owner.is_open());
    }

    #[tokio::test]
    async fn sever_ends_streams_and_keeps_durable_messages() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        let queue = channel
            .declare_queue(&QueueSpec::durable("work"))
            .await
            .expect("queue");
        channel.bind_queue(&queue, EXCHANGE, "GetProfile").await.expect("bind");
        let mut deliveries = channel.consume(&queue).await.expect("consume");
        broker.inject(EXCHANGE, "GetProfile", b"1".to_vec()).expect("inject");

        broker.sever_connections();

        assert!(deliveries.next().await.is_none());
        assert_eq!(broker.consumer_count(&queue), 0);
        assert_eq!(broker.message_count(&queue), 1);
        assert!(matches!(
            channel.publish(EXCHANGE, "GetProfile", b"2").await,
            Err(BrokerError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn injected_faults_are_counted() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        let channel = channel(&broker).await;
        assert_eq!(broker.connect_attempts(), 2);

        broker.fail_next_publishes(1);
        assert!(channel.publish(EXCHANGE, "X", b"{}").await.is_err());
        assert!(channel.is_open());
        channel.publish(EXCHANGE, "X", b"{}").await.expect("second publish");
        assert_eq!(broker.publish_attempts(), 2);

        assert!(matches!(
            channel.publish("missing", "X", b"{}").await,
            Err(BrokerError::PublishFailed { .. })
        ));
    }
}
