// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! [`Broker`] owns the single logical connection to RabbitMQ. It opens the
//! transport connection and a management channel, keeps the
//! [`ConnectionState`] that everything else waits on, notifies registered
//! [`ConnectionObserver`]s of every transition, and reconnects with a linear,
//! capped backoff after an abnormal closure.
//!
//! Publishing and declarations go through the management channel. While the
//! connection is not Ready they wait rather than fail; wrap them in a timeout
//! when a fail-fast behavior is needed.

use crate::{
    channel::LapinTransport,
    config::BrokerOptions,
    consumer::{Consumer, ConsumerOptions},
    errors::AmqpError,
    events::{self, ListenerHandle},
    exchange::{Exchange, ExchangeOptions},
    message::Message,
    observer::{ConnectionObserver, Dependents, SubscriptionId},
    publisher::Publishing,
    queue::{Queue, QueueOptions},
    topology::{BindingOptions, ExchangeDeclaration, QueueDeclaration},
    transport::{AmqpChannel, AmqpConnection, CloseReason, Transport},
};
use chrono::Utc;
use futures_util::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Whether the transport is usable right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    /// Terminal, after [`Broker::close`].
    Closed,
}

/// Resilient handle to a RabbitMQ broker. Cloning is cheap and every clone
/// shares the same connection.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    options: BrokerOptions,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    connection: Mutex<Option<Arc<dyn AmqpConnection>>>,
    management: AsyncMutex<Option<Arc<dyn AmqpChannel>>>,
    dependents: Arc<Dependents>,
    attempts: AtomicU32,
    epoch: AtomicU64,
    connecting: AsyncMutex<()>,
    watcher: Mutex<Option<ListenerHandle>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Creates a broker speaking AMQP through lapin. Nothing is opened until
    /// [`Broker::connect`].
    pub fn new(options: BrokerOptions) -> Broker {
        Broker::with_transport(options, LapinTransport::new())
    }

    /// Creates a broker on top of the given transport.
    pub fn with_transport(options: BrokerOptions, transport: Arc<dyn Transport>) -> Broker {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Broker {
            inner: Arc::new(BrokerInner {
                options,
                transport,
                state,
                connection: Mutex::new(None),
                management: AsyncMutex::new(None),
                dependents: Arc::new(Dependents::default()),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                connecting: AsyncMutex::new(()),
                watcher: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    pub(crate) fn ready_connection(&self) -> Option<Arc<dyn AmqpConnection>> {
        self.inner.ready_connection()
    }

    /// Opens the connection and the management channel, then notifies every
    /// observer in registration order before returning.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.inner.connect().await
    }

    /// Registers an observer for future transitions. An observer registered
    /// while the broker is Ready is not notified of the current connection.
    pub fn subscribe(&self, observer: Arc<dyn ConnectionObserver>) -> SubscriptionId {
        self.inner.dependents.subscribe(observer)
    }

    /// Removes an observer. Unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.dependents.unsubscribe(id)
    }

    /// Publishes `msg` on the management channel, waiting for the connection
    /// to be Ready.
    ///
    /// # Parameters
    ///
    /// * `msg` - Message to publish. A zero timestamp is filled in when
    ///   `auto_timestamp` is set.
    ///
    /// # Returns
    ///
    /// `BrokerClosed` once the broker is closed, or the publishing failure.
    pub async fn publish(&self, msg: Message) -> Result<(), AmqpError> {
        let publishing = Publishing::prepare(&msg, self.inner.options.auto_timestamp, Utc::now());

        self.inner
            .with_management(move |channel| async move {
                channel.publish(&publishing).await.map_err(|err| {
                    error!(
                        error = err.to_string(),
                        exchange = publishing.exchange.as_str(),
                        "error publishing message"
                    );
                    err
                })
            })
            .await
    }

    /// Starts a consumer. When the broker is Ready the consumer subscribes
    /// right away and subscription failures are returned here; otherwise it
    /// starts on the next connect.
    pub async fn consume(&self, options: ConsumerOptions) -> Result<Consumer, AmqpError> {
        if self.state() == ConnectionState::Closed {
            return Err(AmqpError::BrokerClosed);
        }

        Consumer::register(
            options,
            self.inner.dependents.clone(),
            self.inner.ready_connection(),
        )
        .await
    }

    /// Declares an exchange and returns a handle to it.
    pub async fn exchange(&self, options: ExchangeOptions) -> Result<Exchange, AmqpError> {
        self.declare_exchange(&options).await?;
        Ok(Exchange::new(self.clone(), options.name))
    }

    /// Declares a queue and returns a pull handle to it.
    pub async fn queue(&self, options: QueueOptions) -> Result<Queue, AmqpError> {
        let name = self.declare_queue(&options).await?;
        Ok(Queue::new(self.clone(), name, &options))
    }

    /// Makes sure an exchange with the given properties exists. The default
    /// exchange is validated but never declared.
    pub async fn declare_exchange(&self, options: &ExchangeOptions) -> Result<(), AmqpError> {
        options.validate()?;

        if options.is_default() {
            return Ok(());
        }

        let declaration = ExchangeDeclaration::from(options);
        debug!("creating exchange: {}", declaration.name);

        self.inner
            .with_management(move |channel| async move {
                channel
                    .declare_exchange(&declaration)
                    .await
                    .map_err(|err| {
                        error!(
                            error = err.to_string(),
                            name = declaration.name.as_str(),
                            "error to declare the exchange"
                        );
                        AmqpError::DeclareExchangeError(declaration.name.clone(), err.to_string())
                    })
            })
            .await
    }

    /// Deletes an exchange, with its bindings.
    ///
    /// # Parameters
    ///
    /// * `name` - Name of the exchange to delete.
    ///
    /// # Returns
    ///
    /// `DeleteExchangeError` when the broker refuses the deletion.
    pub async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let name = name.to_owned();

        self.inner
            .with_management(move |channel| async move {
                channel.delete_exchange(&name).await.map_err(|err| {
                    error!(error = err.to_string(), name = name.as_str(), "error to delete the exchange");
                    AmqpError::DeleteExchangeError(name.clone(), err.to_string())
                })
            })
            .await
    }

    /// Makes sure a queue with the given properties exists.
    ///
    /// # Parameters
    ///
    /// * `options` - Queue definition. An empty name asks the broker for one.
    ///
    /// # Returns
    ///
    /// The queue name, as assigned by the broker for server-named queues.
    pub async fn declare_queue(&self, options: &QueueOptions) -> Result<String, AmqpError> {
        let declaration = QueueDeclaration::from(options);
        debug!("creating queue: {}", declaration.name);

        self.inner
            .with_management(move |channel| async move {
                match channel.declare_queue(&declaration).await {
                    Ok(name) => {
                        debug!("queue: {} was created", name);
                        Ok(name)
                    }
                    Err(err) => {
                        error!(error = err.to_string(), name = declaration.name.as_str(), "error to declare the queue");
                        Err(AmqpError::DeclareQueueError(
                            declaration.name.clone(),
                            err.to_string(),
                        ))
                    }
                }
            })
            .await
    }

    /// Returns the number of messages deleted with the queue.
    pub async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let name = name.to_owned();

        self.inner
            .with_management(move |channel| async move {
                channel.delete_queue(&name).await.map_err(|err| {
                    error!(error = err.to_string(), name = name.as_str(), "error to delete the queue");
                    AmqpError::DeleteQueueError(name.clone(), err.to_string())
                })
            })
            .await
    }

    /// Binds `options.queue` to `options.exchange` with `options.routing_key`.
    pub async fn declare_binding(&self, options: &BindingOptions) -> Result<(), AmqpError> {
        self.bind_queue(&options.queue, &options.exchange, &options.routing_key)
            .await
    }

    pub(crate) async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );
        let (queue, exchange, routing_key) =
            (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());

        self.inner
            .with_management(move |channel| async move {
                channel
                    .bind_queue(&queue, &exchange, &routing_key)
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to bind queue to exchange");
                        AmqpError::BindingExchangeToQueueError(exchange, queue, err.to_string())
                    })
            })
            .await
    }

    /// Removes a binding between a queue and an exchange.
    ///
    /// # Parameters
    ///
    /// * `queue` - Bound queue.
    /// * `exchange` - Exchange the queue is bound to.
    /// * `routing_key` - Key of the binding to remove.
    ///
    /// # Returns
    ///
    /// `UnbindingExchangeFromQueueError` when the broker refuses the unbind.
    pub async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let (queue, exchange, routing_key) =
            (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());

        self.inner
            .with_management(move |channel| async move {
                channel
                    .unbind_queue(&queue, &exchange, &routing_key)
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "error to unbind queue from exchange");
                        AmqpError::UnbindingExchangeFromQueueError(exchange, queue, err.to_string())
                    })
            })
            .await
    }

    /// Shuts the broker down for good. Observers are told to disconnect, then
    /// the management channel and the connection are closed. Every failure
    /// is reported, not only the first.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let inner = &self.inner;

        if inner.state.send_replace(ConnectionState::Closed) == ConnectionState::Closed {
            return Ok(());
        }
        info!("closing broker connection");

        let reconnect = inner.reconnect.lock().take();
        if let Some(task) = reconnect {
            task.abort();
        }

        let watcher = inner.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.cancel();
        }

        let mut errors = vec![];

        for observer in inner.dependents.snapshot() {
            if let Err(err) = observer.on_disconnect().await {
                errors.push(err);
            }
        }

        let management = inner.management.lock().await.take();
        if let Some(channel) = management {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "error to close the management channel");
                errors.push(err);
            }
        }

        let connection = inner.connection.lock().take();
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                error!(error = err.to_string(), "error to close the connection");
                errors.push(err);
            }
        }

        AmqpError::collect(errors)
    }
}

impl BrokerInner {
    async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _connecting = self.connecting.lock().await;

        let state = *self.state.borrow();
        match state {
            ConnectionState::Closed => return Err(AmqpError::BrokerClosed),
            ConnectionState::Ready => return Ok(()),
            _ => {}
        }

        self.set_state(ConnectionState::Connecting);

        match self.open().await {
            Ok(connection) => {
                self.notify_connect(connection).await;
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn open(self: &Arc<Self>) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let uri = self.options.url()?;

        debug!("creating amqp connection...");
        let connection = self
            .transport
            .dial(&uri, &self.options.connection_name)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to connect");
                err
            })?;

        debug!("creating amqp management channel...");
        let management = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the management channel");
                if let Err(close_err) = connection.close().await {
                    warn!(error = close_err.to_string(), "error to close half-open connection");
                }
                return Err(err);
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let broker = Arc::downgrade(self);
        let watcher = events::on_close(connection.notify_close(), move |reason| async move {
            if let Some(broker) = broker.upgrade() {
                broker.handle_close(epoch, reason).await;
            }
        });

        let previous = self.watcher.lock().replace(watcher);
        if let Some(previous) = previous {
            previous.cancel();
        }

        *self.connection.lock() = Some(connection.clone());
        *self.management.lock().await = Some(management);

        if !self.set_state(ConnectionState::Ready) {
            // close() ran while we were dialing: whatever it did not see is ours to tear down.
            let management = self.management.lock().await.take();
            if let Some(channel) = management {
                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "error to close the management channel of a closed broker");
                }
            }
            let connection = self.connection.lock().take();
            if let Some(connection) = connection {
                if let Err(err) = connection.close().await {
                    warn!(error = err.to_string(), "error to close the connection of a closed broker");
                }
            }
            return Err(AmqpError::BrokerClosed);
        }

        self.attempts.store(0, Ordering::SeqCst);
        info!("broker connection ready");

        Ok(connection)
    }

    async fn notify_connect(&self, connection: Arc<dyn AmqpConnection>) {
        for observer in self.dependents.snapshot() {
            if let Err(err) = observer.on_connect(connection.clone()).await {
                warn!(error = err.to_string(), "observer failed to handle connect");
            }
        }
    }

    async fn handle_close(self: Arc<Self>, epoch: u64, reason: CloseReason) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("ignoring closure of a replaced connection");
            return;
        }

        let abnormal = match &reason {
            CloseReason::Abnormal(err) => {
                warn!(error = err.to_string(), "broker connection lost");
                true
            }
            CloseReason::Normal => {
                debug!("broker connection closed");
                false
            }
        };

        if !self.set_state(ConnectionState::Disconnected) {
            return;
        }

        self.connection.lock().take();
        self.management.lock().await.take();

        for observer in self.dependents.snapshot() {
            if let Err(err) = observer.on_disconnect().await {
                warn!(error = err.to_string(), "observer failed to handle disconnect");
            }
        }

        if abnormal {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let task = tokio::spawn(reconnect(Arc::downgrade(self)));

        let previous = self.reconnect.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Moves to `next` unless the broker was closed. Returns false when closed.
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut open = true;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                open = false;
                return false;
            }
            let changed = *state != next;
            *state = next;
            changed
        });
        open
    }

    fn ready_connection(&self) -> Option<Arc<dyn AmqpConnection>> {
        if *self.state.borrow() != ConnectionState::Ready {
            return None;
        }
        self.connection.lock().clone()
    }

    async fn wait_ready(&self) -> Result<(), AmqpError> {
        let mut state = self.state.subscribe();

        let closed = {
            let current = state
                .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
                .await
                .map_err(|_| AmqpError::InternalError)?;
            *current == ConnectionState::Closed
        };

        if closed {
            return Err(AmqpError::BrokerClosed);
        }

        Ok(())
    }

    /// Runs `op` on the management channel while holding its lock, waiting
    /// for the connection to be Ready first. A management channel closed by a
    /// channel-level error is replaced on the live connection.
    async fn with_management<T, F, Fut>(&self, op: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<dyn AmqpChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let (channel, guard) = loop {
            self.wait_ready().await?;

            let mut guard = self.management.lock().await;
            let current = guard.as_ref().cloned();
            match current {
                Some(channel) if channel.is_open() => break (channel, guard),
                Some(_) => {
                    let connection = self.connection.lock().clone();
                    let Some(connection) = connection else {
                        drop(guard);
                        tokio::task::yield_now().await;
                        continue;
                    };

                    warn!("management channel closed, opening a new one");
                    let channel = connection.open_channel().await?;
                    *guard = Some(channel.clone());
                    break (channel, guard);
                }
                None => {
                    drop(guard);
                    tokio::task::yield_now().await;
                }
            }
        };

        let result = op(channel).await;
        drop(guard);

        result
    }
}

fn reconnect(broker: Weak<BrokerInner>) -> BoxFuture<'static, ()> {
    async move {
        loop {
            let Some(inner) = broker.upgrade() else {
                return;
            };
            let attempts = inner.attempts.load(Ordering::SeqCst);
            let delay = inner.options.backoff(attempts);
            drop(inner);

            debug!(attempts, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::time::sleep(delay).await;

            let Some(inner) = broker.upgrade() else {
                return;
            };

            match inner.connect().await {
                Ok(()) => return,
                Err(AmqpError::BrokerClosed) => return,
                Err(err) => {
                    let attempts = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(error = err.to_string(), attempts, "reconnect failed");
                }
            }
        }
    }
    .boxed()
}
