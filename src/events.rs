// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Closure Events
//!
//! Transports report closure through one-shot receivers. [`CloseNotifier`] is
//! the sending side shared by the transport implementations, and [`on_close`]
//! turns a receiver into a callback running on its own dispatch task.

use crate::transport::CloseReason;
use parking_lot::Mutex;
use std::future::Future;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::debug;

/// Fires a [`CloseReason`] once to every subscriber, including the ones that
/// subscribe after the fact.
#[derive(Default)]
pub(crate) struct CloseNotifier {
    state: Mutex<NotifierState>,
}

#[derive(Default)]
struct NotifierState {
    fired: Option<CloseReason>,
    subscribers: Vec<oneshot::Sender<CloseReason>>,
}

impl CloseNotifier {
    pub(crate) fn subscribe(&self) -> oneshot::Receiver<CloseReason> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();

        match &state.fired {
            Some(reason) => {
                let _ = tx.send(reason.clone());
            }
            None => state.subscribers.push(tx),
        }

        rx
    }

    /// Returns false when a reason was already fired; the first one wins.
    pub(crate) fn fire(&self, reason: CloseReason) -> bool {
        let mut state = self.state.lock();
        if state.fired.is_some() {
            return false;
        }

        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.send(reason.clone());
        }
        state.fired = Some(reason);

        true
    }

    #[cfg(test)]
    pub(crate) fn is_fired(&self) -> bool {
        self.state.lock().fired.is_some()
    }
}

/// Handle of a listener installed with [`on_close`].
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stops the listener. A handler that already started runs to completion
    /// only if it is past its last await point.
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs `handler` on a dedicated task once `notification` resolves.
///
/// A notification whose sender went away without firing is treated as no
/// event at all: the handler is not invoked.
pub fn on_close<F, Fut>(notification: oneshot::Receiver<CloseReason>, handler: F) -> ListenerHandle
where
    F: FnOnce(CloseReason) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(async move {
        match notification.await {
            Ok(reason) => handler(reason).await,
            Err(_) => debug!("close notifier dropped without firing"),
        }
    });

    ListenerHandle { task }
}
