// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::AppError;

/// Handle returned by `subscribe`, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Something a connection reports to its subscribers.
///
/// Events borrow their payload: handlers that need to keep a message clone it.
#[derive(Debug)]
pub enum ConnectionEvent<'a, M> {
    /// The sign-on message has been written to the socket.
    SignOn(&'a M),
    /// The connection reached `Disconnected`, with the sign-off message that was sent.
    SignOff(Option<&'a M>),
    MessageReceived(&'a M),
    Error(&'a AppError),
    /// A heartbeat has been written to the socket.
    LifeCheck,
}

impl<M> Clone for ConnectionEvent<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for ConnectionEvent<'_, M> {}

impl<M> ConnectionEvent<'_, M> {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::SignOn(_) => "sign_on",
            ConnectionEvent::SignOff(_) => "sign_off",
            ConnectionEvent::MessageReceived(_) => "message_received",
            ConnectionEvent::Error(_) => "error",
            ConnectionEvent::LifeCheck => "life_check",
        }
    }
}

/// Registered handlers, called in registration order.
///
/// The list is copied before dispatching so a handler may subscribe or
/// unsubscribe without deadlocking.
pub(crate) struct Subscribers<H: ?Sized> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, Arc<H>)>>,
}

impl<H: ?Sized> Subscribers<H> {
    pub(crate) fn new() -> Self {
        Subscribers {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, handler: Arc<H>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<H>> {
        self.handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.read().len()
    }
}

impl<H: ?Sized> fmt::Debug for Subscribers<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    type Handler = dyn Fn(usize) + Send + Sync;

    #[test]
    fn handlers_run_in_registration_order() {
        let subscribers: Subscribers<Handler> = Subscribers::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let log = log.clone();
            subscribers.add(Arc::new(move |n: usize| log.lock().push((tag, n))));
        }
        for handler in subscribers.snapshot() {
            handler(7);
        }
        assert_eq!(*log.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn removed_handler_is_not_called() {
        let subscribers: Subscribers<Handler> = Subscribers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = subscribers.add(Arc::new(move |_: usize| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(subscribers.remove(id));
        assert!(!subscribers.remove(id));
        for handler in subscribers.snapshot() {
            handler(1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn event_names() {
        let msg = 3u8;
        assert_eq!(ConnectionEvent::MessageReceived(&msg).name(), "message_received");
        assert_eq!(ConnectionEvent::<u8>::SignOff(None).name(), "sign_off");
        assert_eq!(ConnectionEvent::<u8>::LifeCheck.name(), "life_check");
    }
}
