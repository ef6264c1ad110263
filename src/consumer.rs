// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`Consumer`] is a dependent of the broker connection. Every time the
//! connection becomes Ready it opens its own channel and starts a delivery
//! pump, a background task that hands each delivery to the consumer's message
//! stream. When the channel goes away the pump stops, and the next connect
//! starts a new one; callers keep reading the same stream throughout.
//!
//! Hand-off is a rendezvous driven by the reader: every read posts a request
//! and the pump answers it with one delivery, checking its channel is still
//! open right before answering. A slow reader holds the pump back, which in
//! turn holds back the broker, and a delivery of a closed channel is never
//! handed out.

use crate::{
    errors::AmqpError,
    events::{self, ListenerHandle},
    message::Message,
    observer::{ConnectionObserver, Dependents, SubscriptionId},
    transport::{AmqpChannel, AmqpConnection, CloseReason, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A reader waiting for its next message.
type Request = oneshot::Sender<Message>;

/// Options for consumer setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Consumer tag; generated from the queue name when empty.
    pub name: String,
    pub queue: String,
    pub auto_ack: bool,
    pub exclusive: bool,
}

impl ConsumerOptions {
    /// Creates options consuming from `queue` with manual acknowledgments.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to consume from
    ///
    /// # Returns
    /// Options with a generated consumer tag, non-exclusive
    pub fn new(queue: &str) -> ConsumerOptions {
        ConsumerOptions {
            queue: queue.to_owned(),
            ..ConsumerOptions::default()
        }
    }

    /// Sets the consumer tag. Tags must be unique on the broker.
    ///
    /// # Parameters
    /// * `tag` - The consumer tag
    ///
    /// # Returns
    /// Self for method chaining
    pub fn name(mut self, tag: &str) -> Self {
        self.name = tag.to_owned();
        self
    }

    /// Lets the broker consider messages acknowledged as soon as they are
    /// delivered.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Asks to be the only consumer of the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Registered, no channel.
    Idle,
    Connecting,
    /// The delivery pump is running.
    Consuming,
    /// `close` is waiting for the pump to stop.
    Draining,
    Closed,
}

/// Gets messages from the broker, across reconnects.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    options: ConsumerOptions,
    dependents: Arc<Dependents>,
    subscription: Mutex<Option<SubscriptionId>>,
    lifecycle: AsyncMutex<()>,
    state: watch::Sender<ConsumerState>,
    pumping: watch::Sender<bool>,
    channel: Mutex<Option<Arc<dyn AmqpChannel>>>,
    /// Taken by `close`; readers fail once it is gone.
    requests: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    /// Held by the running pump for its whole run.
    pending: AsyncMutex<mpsc::UnboundedReceiver<Request>>,
    error_streams: Mutex<Vec<mpsc::UnboundedSender<AmqpError>>>,
    close_listener: Mutex<Option<ListenerHandle>>,
}

impl Consumer {
    fn new(mut options: ConsumerOptions, dependents: Arc<Dependents>) -> Consumer {
        if options.name.is_empty() {
            options.name = format!("{}-{}", options.queue, Uuid::new_v4());
        }

        let (requests, pending) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConsumerState::Idle);
        let (pumping, _) = watch::channel(false);

        Consumer {
            inner: Arc::new(ConsumerInner {
                options,
                dependents,
                subscription: Mutex::new(None),
                lifecycle: AsyncMutex::new(()),
                state,
                pumping,
                channel: Mutex::new(None),
                requests: Mutex::new(Some(requests)),
                pending: AsyncMutex::new(pending),
                error_streams: Mutex::new(vec![]),
                close_listener: Mutex::new(None),
            }),
        }
    }

    /// Registers a new consumer with the broker's dependents and, when a Ready
    /// connection is given, subscribes right away.
    pub(crate) async fn register(
        options: ConsumerOptions,
        dependents: Arc<Dependents>,
        connection: Option<Arc<dyn AmqpConnection>>,
    ) -> Result<Consumer, AmqpError> {
        let consumer = Consumer::new(options, dependents.clone());

        let id = dependents.subscribe(Arc::new(Observer(Arc::downgrade(&consumer.inner))));
        *consumer.inner.subscription.lock() = Some(id);

        if let Some(connection) = connection {
            if let Err(err) = consumer.inner.clone().on_connect(connection).await {
                dependents.unsubscribe(id);
                consumer.inner.state.send_replace(ConsumerState::Closed);
                return Err(err);
            }
        }

        Ok(consumer)
    }

    pub fn tag(&self) -> &str {
        &self.inner.options.name
    }

    pub fn queue(&self) -> &str {
        &self.inner.options.queue
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.borrow()
    }

    /// Incoming messages. The stream ends once the consumer is closed.
    ///
    /// Every call returns a view of the same underlying stream, so concurrent
    /// readers share the messages between them.
    pub fn messages(&self) -> BoxStream<'static, Message> {
        stream::unfold(self.clone(), |consumer| async move {
            let next = consumer.recv().await;
            next.map(|msg| (msg, consumer))
        })
        .boxed()
    }

    /// Waits for the next message; `None` once the consumer is closed.
    ///
    /// Dropping the returned future before it completes loses no message:
    /// the pump keeps the delivery for the next reader.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            let requests = self.inner.requests.lock().clone()?;

            let (reply, answer) = oneshot::channel();
            requests.send(reply).ok()?;
            drop(requests);

            // a dropped request means the pump stopped or was drained by close
            if let Ok(msg) = answer.await {
                return Some(msg);
            }
        }
    }

    /// A new stream of asynchronous channel failures. Every failure is sent
    /// to every stream registered at that time.
    pub fn err_chan(&self) -> mpsc::UnboundedReceiver<AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.error_streams.lock().push(tx);
        rx
    }

    /// Gracefully shuts down the consumer.
    ///
    /// The consumer tag is cancelled first so deliveries already buffered
    /// drain through the pump and the delivery stream ends on its own; only
    /// then the message stream and the channel are closed. Calling it again
    /// is a no-op.
    ///
    /// # Returns
    /// Ok(()) or every teardown failure, aggregated
    pub async fn close(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let state = *inner.state.borrow();
        if state == ConsumerState::Closed {
            return Ok(());
        }
        inner.state.send_replace(ConsumerState::Draining);

        let subscription = inner.subscription.lock().take();
        if let Some(id) = subscription {
            inner.dependents.unsubscribe(id);
        }

        let mut errors = vec![];

        let channel = inner.channel.lock().clone();
        if let Some(channel) = channel.filter(|c| c.is_open()) {
            if let Err(err) = channel.cancel(&inner.options.name).await {
                warn!(
                    error = err.to_string(),
                    tag = inner.options.name.as_str(),
                    "failure to cancel consumer, closing its channel"
                );
                errors.push(err);
                if let Err(err) = channel.close().await {
                    errors.push(err);
                }
            }
        }

        inner.pump_stopped().await;

        inner.requests.lock().take();
        {
            let mut pending = inner.pending.lock().await;
            pending.close();
            while pending.try_recv().is_ok() {}
        }

        let listener = inner.close_listener.lock().take();
        if let Some(listener) = listener {
            listener.cancel();
        }

        let channel = inner.channel.lock().take();
        if let Some(channel) = channel.filter(|c| c.is_open()) {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "error to close the consumer channel");
                errors.push(err);
            }
        }

        inner.state.send_replace(ConsumerState::Closed);
        debug!(tag = inner.options.name.as_str(), "consumer closed");

        AmqpError::collect(errors)
    }
}

impl ConsumerInner {
    async fn on_connect(
        self: Arc<Self>,
        connection: Arc<dyn AmqpConnection>,
    ) -> Result<(), AmqpError> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = *self.state.borrow();
        match state {
            ConsumerState::Draining | ConsumerState::Closed => return Ok(()),
            ConsumerState::Consuming if self.channel_open() => return Ok(()),
            _ => {}
        }

        // a pump of the previous connection stops once it sees its channel closed
        self.pump_stopped().await;

        if self.requests.lock().is_none() {
            return Ok(());
        }

        self.state.send_replace(ConsumerState::Connecting);

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer channel");
                self.state.send_replace(ConsumerState::Idle);
                return Err(err);
            }
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        *self.channel.lock() = Some(channel.clone());
        self.pumping.send_replace(true);
        tokio::spawn(self.clone().pump(channel.clone(), ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(
                    queue = self.options.queue.as_str(),
                    tag = self.options.name.as_str(),
                    "consumer subscribed"
                );
                Ok(())
            }
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    queue = self.options.queue.as_str(),
                    "error to create the consumer"
                );
                self.channel.lock().take();
                if channel.is_open() {
                    if let Err(close_err) = channel.close().await {
                        warn!(error = close_err.to_string(), "error to close the consumer channel");
                    }
                }
                Err(err)
            }
            Err(_) => Err(AmqpError::InternalError),
        }
    }

    /// Runs for as long as the channel delivers. Owns the channel's delivery
    /// stream and the pending read requests; `pumping` stays true until it
    /// returns.
    async fn pump(
        self: Arc<Self>,
        channel: Arc<dyn AmqpChannel>,
        ready: oneshot::Sender<Result<(), AmqpError>>,
    ) {
        let mut closed = channel.notify_close();
        let mut pending = self.pending.lock().await;

        let consumed = channel
            .consume(
                &self.options.queue,
                &self.options.name,
                self.options.auto_ack,
                self.options.exclusive,
            )
            .await;

        let mut deliveries = match consumed {
            Ok(deliveries) => deliveries,
            Err(err) => {
                let _ = ready.send(Err(err));
                drop(pending);
                self.finish_pump();
                return;
            }
        };

        let consumer = Arc::downgrade(&self);
        let listener = events::on_close(channel.notify_close(), move |reason| async move {
            if let (CloseReason::Abnormal(err), Some(consumer)) = (reason, consumer.upgrade()) {
                consumer.broadcast(err);
            }
        });
        // the listener of a previous channel has fired already or ends with it
        *self.close_listener.lock() = Some(listener);

        self.state.send_replace(ConsumerState::Consuming);
        let _ = ready.send(Ok(()));

        deliver(&channel, &mut deliveries, &mut closed, &mut pending).await;

        drop(deliveries);
        drop(pending);
        self.finish_pump();
    }

    fn finish_pump(&self) {
        self.state.send_if_modified(|state| match state {
            ConsumerState::Connecting | ConsumerState::Consuming => {
                *state = ConsumerState::Idle;
                true
            }
            _ => false,
        });
        self.pumping.send_replace(false);

        debug!(tag = self.options.name.as_str(), "delivery pump stopped");
    }

    async fn pump_stopped(&self) {
        let mut pumping = self.pumping.subscribe();
        let _ = pumping.wait_for(|running| !*running).await;
    }

    fn channel_open(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .map_or(false, |channel| channel.is_open())
    }

    fn broadcast(&self, err: AmqpError) {
        warn!(
            error = err.to_string(),
            tag = self.options.name.as_str(),
            "consumer channel closed"
        );

        self.error_streams
            .lock()
            .retain(|stream| stream.send(err.clone()).is_ok());
    }
}

/// Hands deliveries to waiting readers until the stream ends or the channel
/// closes. A closed channel wins over a pending delivery or hand-off, and the
/// delivery in hand is dropped with it.
async fn deliver(
    channel: &Arc<dyn AmqpChannel>,
    deliveries: &mut DeliveryStream,
    closed: &mut oneshot::Receiver<CloseReason>,
    pending: &mut mpsc::UnboundedReceiver<Request>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut *closed => None,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                warn!(error = err.to_string(), "errors consume msg");
                return;
            }
            None => return,
        };
        let mut msg = Message::from_delivery(delivery, channel.clone());

        loop {
            let request = tokio::select! {
                biased;
                _ = &mut *closed => return,
                request = pending.recv() => request,
            };

            let Some(reply) = request else {
                return;
            };
            if !channel.is_open() {
                return;
            }

            match reply.send(msg) {
                Ok(()) => break,
                // the reader gave up; keep the message for the next one
                Err(returned) => msg = returned,
            }
        }
    }
}

/// What the broker's dependents registry holds for a consumer.
struct Observer(Weak<ConsumerInner>);

#[async_trait]
impl ConnectionObserver for Observer {
    async fn on_connect(&self, connection: Arc<dyn AmqpConnection>) -> Result<(), AmqpError> {
        match self.0.upgrade() {
            Some(consumer) => consumer.on_connect(connection).await,
            None => Ok(()),
        }
    }

    async fn on_disconnect(&self) -> Result<(), AmqpError> {
        if let Some(consumer) = self.0.upgrade() {
            debug!(
                tag = consumer.options.name.as_str(),
                "connection lost, pump stops with its channel"
            );
        }
        Ok(())
    }
}
