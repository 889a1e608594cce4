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

use tokio::sync::broadcast;

/// Sending side of a shutdown signal, shared by every task of one owner.
#[derive(Debug, Clone)]
pub struct ShutdownNotifier {
    notify: broadcast::Sender<()>,
}

impl ShutdownNotifier {
    pub fn new() -> ShutdownNotifier {
        let (notify, _) = broadcast::channel(1);
        ShutdownNotifier { notify }
    }

    /// Must be called before the task is spawned, a receiver created after
    /// `trigger` never sees the signal.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }

    /// Signals every current subscriber. Returns how many were listening.
    pub fn trigger(&self) -> usize {
        self.notify.send(()).unwrap_or(0)
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for the shutdown signal of a connection or of the accept loop.
///
/// Once a signal has been observed, `recv` returns immediately on every later call.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Waits for the signal. A dropped sender counts as a shutdown too.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_returns_after_signal_and_stays_shut() {
        let (tx, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(tx.subscribe());
        assert!(!shutdown.is_shutdown());

        tx.send(()).unwrap();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // second call must not wait for another signal
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn notifier_reaches_all_subscribers() {
        let notifier = ShutdownNotifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        assert_eq!(notifier.trigger(), 2);
        first.recv().await;
        second.recv().await;
        assert!(first.is_shutdown() && second.is_shutdown());
    }

    #[test]
    fn trigger_without_subscribers_is_harmless() {
        assert_eq!(ShutdownNotifier::default().trigger(), 0);
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, rx) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::new(rx);
        drop(tx);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }
}
