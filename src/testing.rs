// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker behind the transport traits, for tests that need more
//! than a single mocked call: routing, consumers, acknowledgments and
//! connection loss.

use crate::{
    config::BrokerOptions,
    errors::AmqpError,
    events::CloseNotifier,
    exchange::ExchangeKind,
    message::HeaderValue,
    publisher::Publishing,
    topology::{ExchangeDeclaration, QueueDeclaration},
    transport::{
        Acknowledge, AmqpChannel, AmqpConnection, CloseReason, Delivery, DeliveryStream,
        Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Broker options with reconnect delays short enough for tests.
pub(crate) fn test_options() -> BrokerOptions {
    BrokerOptions {
        reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 50,
        ..BrokerOptions::default()
    }
}

/// Polls `condition` until it holds, for up to two seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub(crate) struct MemoryTransport {
    server: Arc<Server>,
    dials: AtomicU32,
    refusals: AtomicU32,
}

impl MemoryTransport {
    pub(crate) fn new() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            server: Arc::new(Server::default()),
            dials: AtomicU32::new(0),
            refusals: AtomicU32::new(0),
        })
    }

    /// The next `n` dials fail.
    pub(crate) fn refuse_dials(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Creates a queue server-side, as if another client had declared it.
    pub(crate) fn declare_queue(&self, name: &str) {
        self.server
            .state
            .lock()
            .queues
            .entry(name.to_owned())
            .or_default();
    }

    /// Dial attempts so far, refused ones included.
    pub(crate) fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Closes every open connection as a network failure would.
    pub(crate) fn drop_connections(&self) {
        let connections: Vec<_> = self.server.connections.lock().drain(..).collect();
        let reason = CloseReason::Abnormal(AmqpError::TransportClosed(
            "connection reset by peer".to_owned(),
        ));

        for connection in connections {
            connection.shutdown(reason.clone());
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(
        &self,
        _uri: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::DialError("connection refused".to_owned()));
        }

        let connection = Arc::new(MemoryConnection {
            server: self.server.clone(),
            open: AtomicBool::new(true),
            notifier: CloseNotifier::default(),
            channels: Mutex::new(vec![]),
        });
        self.server.connections.lock().push(connection.clone());

        Ok(connection)
    }
}

#[derive(Default)]
struct Server {
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    state: Mutex<ServerState>,
    next_channel: AtomicU64,
}

#[derive(Default)]
struct ServerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    /// (queue, exchange, routing key)
    bindings: Vec<(String, String, String)>,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<Stored>,
    subscribers: Vec<Subscriber>,
    turn: usize,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    headers: HashMap<String, HeaderValue>,
    content_type: Option<String>,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    timestamp: Option<u64>,
    redelivered: bool,
}

struct Subscriber {
    tag: String,
    channel: u64,
    exclusive: bool,
    auto_ack: bool,
    delivery_tags: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

impl Server {
    /// Hands ready messages of `queue` to its subscribers, round robin.
    fn dispatch(self: &Arc<Self>, state: &mut ServerState, queue: &str) {
        let Some(memory) = state.queues.get_mut(queue) else {
            return;
        };

        while !memory.subscribers.is_empty() {
            let Some(stored) = memory.ready.pop_front() else {
                return;
            };

            let index = memory.turn % memory.subscribers.len();
            let subscriber = &memory.subscribers[index];
            let acker = MemoryAcker {
                server: Arc::downgrade(self),
                queue: queue.to_owned(),
                stored: stored.clone(),
                settled: AtomicBool::new(subscriber.auto_ack),
            };
            let delivery = Delivery {
                delivery_tag: subscriber.delivery_tags.fetch_add(1, Ordering::SeqCst) + 1,
                redelivered: stored.redelivered,
                exchange: stored.exchange.clone(),
                routing_key: stored.routing_key.clone(),
                body: stored.body.clone(),
                headers: stored.headers.clone(),
                content_type: stored.content_type.clone(),
                correlation_id: stored.correlation_id.clone(),
                reply_to: stored.reply_to.clone(),
                timestamp: stored.timestamp,
                acker: Arc::new(acker),
            };

            if subscriber.tx.send(Ok(delivery)).is_err() {
                memory.subscribers.remove(index);
                memory.ready.push_front(stored);
                continue;
            }
            memory.turn = memory.turn.wrapping_add(1);
        }
    }

    fn requeue(self: &Arc<Self>, queue: &str, mut stored: Stored) {
        let mut state = self.state.lock();
        let Some(memory) = state.queues.get_mut(queue) else {
            return;
        };
        stored.redelivered = true;
        memory.ready.push_back(stored);
        self.dispatch(&mut state, queue);
    }

    fn drop_subscribers(&self, channel: u64) {
        for queue in self.state.lock().queues.values_mut() {
            queue.subscribers.retain(|s| s.channel != channel);
        }
    }
}

struct MemoryConnection {
    server: Arc<Server>,
    open: AtomicBool,
    notifier: CloseNotifier,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    fn shutdown(&self, reason: CloseReason) {
        self.open.store(false, Ordering::SeqCst);

        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for channel in channels {
            channel.shutdown(reason.clone());
        }

        self.notifier.fire(reason);
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let channel = Arc::new(MemoryChannel {
            id: self.server.next_channel.fetch_add(1, Ordering::SeqCst),
            server: self.server.clone(),
            open: AtomicBool::new(true),
            notifier: CloseNotifier::default(),
            delivery_tags: Arc::new(AtomicU64::new(0)),
        });
        self.channels.lock().push(channel.clone());

        Ok(channel)
    }

    fn notify_close(&self) -> oneshot::Receiver<CloseReason> {
        self.notifier.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::TransportClosed("connection is closed".to_owned()));
        }

        self.server
            .connections
            .lock()
            .retain(|c| c.open.load(Ordering::SeqCst) && !std::ptr::eq(c.as_ref(), self));
        self.shutdown(CloseReason::Normal);

        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    server: Arc<Server>,
    open: AtomicBool,
    notifier: CloseNotifier,
    delivery_tags: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed)
        }
    }

    fn shutdown(&self, reason: CloseReason) {
        self.open.store(false, Ordering::SeqCst);
        // subscribers go first: their streams end before the closure is observed
        self.server.drop_subscribers(self.id);
        self.notifier.fire(reason);
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.server.state.lock();

        match state.exchanges.get(&declaration.name) {
            Some(kind) if *kind != declaration.kind => Err(AmqpError::ChannelError(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                declaration.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(declaration.name.clone(), declaration.kind);
                Ok(())
            }
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.server.state.lock();

        state.exchanges.remove(name);
        state.bindings.retain(|(_, exchange, _)| exchange != name);
        Ok(())
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<String, AmqpError> {
        self.ensure_open()?;

        let name = if declaration.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            declaration.name.clone()
        };
        self.server
            .state
            .lock()
            .queues
            .entry(name.clone())
            .or_default();

        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.ensure_open()?;
        let mut state = self.server.state.lock();

        state.bindings.retain(|(queue, _, _)| queue != name);
        Ok(state
            .queues
            .remove(name)
            .map_or(0, |queue| queue.ready.len() as u32))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.server.state.lock();

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::ChannelError("NOT_FOUND".to_owned()));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        self.server
            .state
            .lock()
            .bindings
            .retain(|(q, e, k)| !(q == queue && e == exchange && k == routing_key));
        Ok(())
    }

    async fn publish(&self, publishing: &Publishing) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.server.state.lock();

        // topic and headers exchanges match their routing keys literally here
        let targets: Vec<String> = if publishing.exchange.is_empty() {
            vec![publishing.routing_key.clone()]
        } else {
            let Some(kind) = state.exchanges.get(&publishing.exchange).copied() else {
                return Err(AmqpError::PublishingError(format!(
                    "NOT_FOUND - no exchange '{}'",
                    publishing.exchange
                )));
            };
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|(_, exchange, key)| {
                    *exchange == publishing.exchange
                        && (kind == ExchangeKind::Fanout || *key == publishing.routing_key)
                })
                .map(|(queue, _, _)| queue.clone())
                .collect();
            targets.dedup();
            targets
        };

        let stored = Stored {
            exchange: publishing.exchange.clone(),
            routing_key: publishing.routing_key.clone(),
            body: publishing.body.clone(),
            headers: publishing.headers.clone(),
            content_type: publishing.content_type.clone(),
            correlation_id: publishing.correlation_id.clone(),
            reply_to: publishing.reply_to.clone(),
            timestamp: publishing.timestamp,
            redelivered: false,
        };

        for target in targets {
            if let Some(queue) = state.queues.get_mut(&target) {
                queue.ready.push_back(stored.clone());
                self.server.dispatch(&mut state, &target);
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        tag: &str,
        auto_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let mut state = self.server.state.lock();

        let tag_in_use = state
            .queues
            .values()
            .flat_map(|q| q.subscribers.iter())
            .any(|s| s.tag == tag);
        if tag_in_use {
            return Err(AmqpError::ConsumeError(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                tag
            )));
        }

        let Some(memory) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumeError(format!(
                "NOT_FOUND - no queue '{}'",
                queue
            )));
        };

        let locked = memory.subscribers.iter().any(|s| s.exclusive);
        if locked || (exclusive && !memory.subscribers.is_empty()) {
            return Err(AmqpError::ConsumeError(format!(
                "ACCESS_REFUSED - queue '{}' in exclusive use",
                queue
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        memory.subscribers.push(Subscriber {
            tag: tag.to_owned(),
            channel: self.id,
            exclusive,
            auto_ack,
            delivery_tags: self.delivery_tags.clone(),
            tx,
        });
        self.server.dispatch(&mut state, queue);

        Ok(stream::unfold(rx, |mut rx| async move {
            let next = rx.recv().await;
            next.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn cancel(&self, tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;

        for queue in self.server.state.lock().queues.values_mut() {
            queue
                .subscribers
                .retain(|s| !(s.channel == self.id && s.tag == tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.shutdown(CloseReason::Normal);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn notify_close(&self) -> oneshot::Receiver<CloseReason> {
        self.notifier.subscribe()
    }
}

struct MemoryAcker {
    server: Weak<Server>,
    queue: String,
    stored: Stored,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, err: fn(String) -> AmqpError) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(err("PRECONDITION_FAILED - unknown delivery tag".to_owned()));
        }
        Ok(())
    }

    fn requeue(&self) {
        if let Some(server) = self.server.upgrade() {
            server.requeue(&self.queue, self.stored.clone());
        }
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self, _multiple: bool) -> Result<(), AmqpError> {
        self.settle(AmqpError::AckMessageError)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(AmqpError::RejectMessageError)?;
        if requeue {
            self.requeue();
        }
        Ok(())
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.settle(AmqpError::NackMessageError)?;
        if requeue {
            self.requeue();
        }
        Ok(())
    }
}
