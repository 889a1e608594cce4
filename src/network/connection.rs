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

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::events::{ConnectionEvent, SubscriptionId, Subscribers};
use super::frame::FrameReader;
use super::{DefaultMessages, Endpoint, Status};
use crate::service::{Shutdown, ShutdownNotifier};
use crate::{AppError, AppResult, ConnectionConfig, MessageModel};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Callback registered with [`Connection::subscribe`].
pub type ConnectionHandler<M> = dyn Fn(&Connection<M>, ConnectionEvent<'_, M>) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundKind {
    Regular,
    SignOn,
}

struct Outbound<M> {
    message: M,
    kind: OutboundKind,
}

/// Write half of the socket with the optional per-write timeout.
struct SocketWriter {
    writer: BufWriter<OwnedWriteHalf>,
    timeout: Option<Duration>,
}

impl SocketWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        match self.timeout {
            Some(limit) => time::timeout(limit, Self::write_and_flush(&mut self.writer, bytes))
                .await
                .map_err(|_| AppError::Timeout(format!("write not completed within {:?}", limit)))?,
            None => Self::write_and_flush(&mut self.writer, bytes).await,
        }
    }

    async fn write_and_flush(writer: &mut BufWriter<OwnedWriteHalf>, bytes: &[u8]) -> AppResult<()> {
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

struct Inner<M: MessageModel> {
    id: u64,
    config: ConnectionConfig,
    peer: RwLock<(String, u16)>,
    status: Mutex<Status>,
    defaults: RwLock<DefaultMessages<M>>,
    heartbeat_enabled: AtomicBool,
    bridge_started: AtomicBool,
    disconnecting: AtomicBool,
    // cleared when a write finds the transport gone, never by a read
    link_open: AtomicBool,
    // owned by this connection only
    outbound: Mutex<VecDeque<Outbound<M>>>,
    outbound_ready: Notify,
    writer: tokio::sync::Mutex<Option<SocketWriter>>,
    shutdown: ShutdownNotifier,
    subscribers: Subscribers<ConnectionHandler<M>>,
}

/// One live socket with its send, receive and heartbeat tasks.
///
/// `Connection` is a cheap handle: clones share the same socket, queue and
/// subscribers. Messages queued with [`send_message`](Connection::send_message)
/// are written in submission order by the send task. Frames read by the
/// receive task are turned into `M` and handed to subscribers as
/// [`ConnectionEvent::MessageReceived`]. Transport and decode failures never
/// leave the tasks, they are reported as [`ConnectionEvent::Error`].
///
/// Handlers run synchronously on the task that raised the event, so they should
/// not block.
pub struct Connection<M: MessageModel> {
    inner: Arc<Inner<M>>,
}

impl<M: MessageModel> Clone for Connection<M> {
    fn clone(&self) -> Self {
        Connection {
            inner: self.inner.clone(),
        }
    }
}

impl<M: MessageModel> PartialEq for Connection<M> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<M: MessageModel> Eq for Connection<M> {}

impl<M: MessageModel> fmt::Debug for Connection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (address, port) = self.inner.peer.read().clone();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("address", &address)
            .field("port", &port)
            .field("status", &self.status())
            .field("subscribers", &self.inner.subscribers)
            .finish()
    }
}

impl<M: MessageModel> Default for Connection<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MessageModel> Connection<M> {
    pub fn new() -> Connection<M> {
        Self::with_config(ConnectionConfig::default())
    }

    pub fn with_config(config: ConnectionConfig) -> Connection<M> {
        Connection {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                config,
                peer: RwLock::new((String::new(), 0)),
                status: Mutex::new(Status::Connected),
                defaults: RwLock::new(DefaultMessages::default()),
                heartbeat_enabled: AtomicBool::new(false),
                bridge_started: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                link_open: AtomicBool::new(false),
                outbound: Mutex::new(VecDeque::new()),
                outbound_ready: Notify::new(),
                writer: tokio::sync::Mutex::new(None),
                shutdown: ShutdownNotifier::new(),
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote host for dialed connections, peer ip for accepted ones.
    pub fn address(&self) -> String {
        self.inner.peer.read().0.clone()
    }

    pub fn port(&self) -> u16 {
        self.inner.peer.read().1
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Whether the bridge is built and the socket can still be written.
    ///
    /// A peer that only closed its sending side stays connected: replies are
    /// still written to it.
    pub fn is_connected(&self) -> bool {
        self.inner.link_open.load(Ordering::Acquire) && !self.is_disconnected()
    }

    /// Number of queued messages the send task has not picked up yet.
    pub fn pending_messages(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    /// Dials `address:port` and starts the tasks.
    ///
    /// The socket buffers are set to `dial_buffer_size` before connecting. When a
    /// default sign-on message is configured it is queued first and `SignOn` is
    /// raised once it has been written.
    pub async fn build_bridge(
        &self,
        address: &str,
        port: u16,
        heartbeat_enabled: bool,
    ) -> AppResult<()> {
        self.claim_bridge()?;
        let stream = match self.dial(address, port).await {
            Ok(stream) => stream,
            Err(e) => {
                self.inner.bridge_started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        // the handshake goes out before anything queued earlier
        let sign_on = self.inner.defaults.read().sign_on.clone();
        let queued_sign_on = sign_on.is_some();
        if let Some(sign_on) = sign_on {
            self.inner.outbound.lock().push_front(Outbound {
                message: sign_on,
                kind: OutboundKind::SignOn,
            });
        }
        let result = self.start_bridge(stream, address.to_string(), port, heartbeat_enabled, None);
        if result.is_err() {
            // no task was spawned, the front entry is still ours
            if queued_sign_on {
                self.inner.outbound.lock().pop_front();
            }
            self.inner.bridge_started.store(false, Ordering::Release);
        }
        result
    }

    /// Adopts a socket accepted by a listener and starts the tasks.
    ///
    /// Writes, and reads of a frame that has already started, are bounded by
    /// `accepted_io_timeout_ms`.
    pub fn build_bridge_accepted(&self, stream: TcpStream, heartbeat_enabled: bool) -> AppResult<()> {
        self.claim_bridge()?;
        let result = stream.peer_addr().map_err(AppError::from).and_then(|peer| {
            trace!(
                connection_id = self.inner.id,
                nodelay = stream.nodelay().unwrap_or(false),
                "adopting accepted socket"
            );
            self.start_bridge(
                stream,
                peer.ip().to_string(),
                peer.port(),
                heartbeat_enabled,
                self.inner.config.accepted_io_timeout(),
            )
        });
        if result.is_err() {
            self.inner.bridge_started.store(false, Ordering::Release);
        }
        result
    }

    fn claim_bridge(&self) -> AppResult<()> {
        if self.is_disconnected() {
            return Err(AppError::IllegalStateError(format!(
                "connection {} is disconnected",
                self.inner.id
            )));
        }
        self.inner
            .bridge_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                AppError::IllegalStateError(format!(
                    "bridge of connection {} already built",
                    self.inner.id
                ))
            })
    }

    async fn dial(&self, address: &str, port: u16) -> AppResult<TcpStream> {
        let buffer_size = self.inner.config.dial_buffer_size;
        let mut last_error = None;
        for addr in lookup_host((address, port)).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_send_buffer_size(buffer_size)?;
            socket.set_recv_buffer_size(buffer_size)?;
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.map(AppError::from).unwrap_or_else(|| {
            AppError::InvalidValue(format!("address {}:{} did not resolve", address, port))
        }))
    }

    fn start_bridge(
        &self,
        stream: TcpStream,
        address: String,
        port: u16,
        heartbeat_enabled: bool,
        io_timeout: Option<Duration>,
    ) -> AppResult<()> {
        let (reader, writer) = stream.into_split();
        {
            let mut slot = self.inner.writer.try_lock().map_err(|_| {
                AppError::IllegalStateError("socket writer is busy while building bridge".into())
            })?;
            *slot = Some(SocketWriter {
                writer: BufWriter::new(writer),
                timeout: io_timeout,
            });
        }
        *self.inner.peer.write() = (address, port);
        self.inner
            .heartbeat_enabled
            .store(heartbeat_enabled, Ordering::Release);
        self.inner.link_open.store(true, Ordering::Release);
        self.set_status_internal(Status::Connected)?;

        // subscribe before spawning, a signal sent earlier would be lost
        let send_shutdown = self.inner.shutdown.subscribe();
        let receive_shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(self.clone().send_loop(send_shutdown));
        tokio::spawn(
            self.clone()
                .receive_loop(FrameReader::new(reader, io_timeout), receive_shutdown),
        );
        if heartbeat_enabled {
            let heartbeat_shutdown = self.inner.shutdown.subscribe();
            tokio::spawn(self.clone().heartbeat_loop(heartbeat_shutdown));
        }

        let (address, port) = self.inner.peer.read().clone();
        info!(
            connection_id = self.inner.id,
            heartbeat_enabled, "bridge built to {}:{}", address, port
        );
        Ok(())
    }

    /// Queues `message` for the send task. Never blocks.
    ///
    /// Messages sent after the connection is disconnected are dropped.
    pub fn send_message(&self, message: M) {
        self.enqueue(message, OutboundKind::Regular);
    }

    /// Queues the sign-on message; `SignOn` is raised once it has been written.
    pub fn send_connection_message(&self, sign_on: M) {
        self.enqueue(sign_on, OutboundKind::SignOn);
    }

    fn enqueue(&self, message: M, kind: OutboundKind) {
        if self.is_disconnected() {
            trace!(connection_id = self.inner.id, "dropping message queued after disconnect");
            return;
        }
        self.inner
            .outbound
            .lock()
            .push_back(Outbound { message, kind });
        self.inner.outbound_ready.notify_one();
    }

    /// Signs off and closes the connection.
    ///
    /// Pending messages are discarded, `sign_off` is queued and given the
    /// configured grace period to drain. Then the status becomes `Disconnected`,
    /// every task stops, the socket is closed and `SignOff` is raised. A failure
    /// to close the socket is reported as [`AppError::HostDisconnected`].
    /// Does nothing if the connection is already disconnecting.
    pub async fn send_disconnect_message(&self, sign_off: Option<M>) {
        if self
            .inner
            .disconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.inner.outbound.lock().clear();
        if let Some(message) = sign_off.clone() {
            self.send_message(message);
        }
        time::sleep(self.inner.config.disconnect_grace()).await;

        if let Err(e) = self.set_status_internal(Status::Disconnected) {
            debug!(connection_id = self.inner.id, "disconnect skipped: {}", e);
            return;
        }
        self.inner.shutdown.trigger();
        self.inner.outbound.lock().clear();

        if let Err(e) = self.close_socket().await {
            self.emit_error(AppError::HostDisconnected(Box::new(e)));
        }
        info!(connection_id = self.inner.id, "connection signed off");
        self.emit(ConnectionEvent::SignOff(sign_off.as_ref()));
    }

    async fn close_socket(&self) -> AppResult<()> {
        self.close_link();
        let writer = self.inner.writer.lock().await.take();
        match writer {
            Some(mut socket) => {
                socket.writer.shutdown().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn close_link(&self) {
        self.inner.link_open.store(false, Ordering::Release);
        self.inner.outbound_ready.notify_one();
    }

    fn set_status_internal(&self, next: Status) -> AppResult<()> {
        let mut status = self.inner.status.lock();
        if *status == Status::Disconnected && next == Status::Disconnected {
            return Err(AppError::IllegalStateError("already disconnected".into()));
        }
        *status = status.transition(next)?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.link_open.load(Ordering::Acquire) && !self.is_disconnected()
    }

    async fn write_bytes(&self, bytes: &[u8]) -> AppResult<()> {
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(socket) => socket.write_all(bytes).await,
            None => Err(io::Error::new(ErrorKind::NotConnected, "socket is closed").into()),
        }
    }

    async fn write_message(&self, message: &M) -> AppResult<()> {
        let bytes = message.get_bytes()?;
        self.write_bytes(&bytes).await
    }

    async fn send_loop(self, mut shutdown: Shutdown) {
        debug!(connection_id = self.inner.id, "send task started");
        while self.is_running() {
            let next = self.inner.outbound.lock().pop_front();
            let entry = match next {
                Some(entry) => entry,
                None => {
                    tokio::select! {
                        _ = self.inner.outbound_ready.notified() => {}
                        _ = shutdown.recv() => {}
                    }
                    continue;
                }
            };
            // the entry is gone from the queue whatever the outcome, no retry
            match self.write_message(&entry.message).await {
                Ok(()) => {
                    if entry.kind == OutboundKind::SignOn {
                        self.emit(ConnectionEvent::SignOn(&entry.message));
                    }
                }
                Err(e) => {
                    let lost = e.is_transport_lost();
                    self.emit_error(e);
                    if lost {
                        self.close_link();
                    }
                }
            }
        }
        debug!(connection_id = self.inner.id, "send task exited");
    }

    async fn receive_loop(self, mut reader: FrameReader<OwnedReadHalf>, mut shutdown: Shutdown) {
        debug!(connection_id = self.inner.id, "receive task started");
        while !self.is_disconnected() {
            let result = tokio::select! {
                res = reader.read_frame() => res,
                _ = shutdown.recv() => break,
            };
            match result {
                Ok(Some(frame)) => match M::from_payload(&frame.payload) {
                    Ok(message) => self.emit(ConnectionEvent::MessageReceived(&message)),
                    Err(e) => self.emit_error(e),
                },
                Ok(None) => {
                    info!(connection_id = self.inner.id, "peer closed its sending side");
                    break;
                }
                // the send task finds out on its next write
                Err(e @ AppError::IoError(_)) => {
                    self.emit_error(e);
                    break;
                }
                Err(e) => {
                    if let AppError::Timeout(_) = e {
                        reader.discard_partial();
                    }
                    self.emit_error(e);
                }
            }
        }
        debug!(connection_id = self.inner.id, "receive task exited");
    }

    async fn heartbeat_loop(self, mut shutdown: Shutdown) {
        debug!(connection_id = self.inner.id, "heartbeat task started");
        let mut interval = time::interval(self.inner.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.is_disconnected() {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => break,
            }
            if self.is_disconnected() {
                break;
            }
            let heartbeat = self.inner.defaults.read().heartbeat.clone();
            let Some(heartbeat) = heartbeat else {
                continue;
            };
            match self.write_message(&heartbeat).await {
                Ok(()) => self.emit(ConnectionEvent::LifeCheck),
                Err(e) => {
                    warn!(
                        connection_id = self.inner.id,
                        "heartbeat failed, signing off: {}", e
                    );
                    self.emit_error(e);
                    let sign_off = self.inner.defaults.read().sign_off.clone();
                    self.send_disconnect_message(sign_off).await;
                    break;
                }
            }
        }
        debug!(connection_id = self.inner.id, "heartbeat task exited");
    }

    /// Registers `handler` for every event of this connection.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection<M>, ConnectionEvent<'_, M>) + Send + Sync + 'static,
    {
        self.inner.subscribers.add(Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(id)
    }

    pub fn on_sign_on<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection<M>, &M) + Send + Sync + 'static,
    {
        self.subscribe(move |conn, event| {
            if let ConnectionEvent::SignOn(message) = event {
                handler(conn, message)
            }
        })
    }

    pub fn on_sign_off<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection<M>, Option<&M>) + Send + Sync + 'static,
    {
        self.subscribe(move |conn, event| {
            if let ConnectionEvent::SignOff(message) = event {
                handler(conn, message)
            }
        })
    }

    pub fn on_message_received<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection<M>, &M) + Send + Sync + 'static,
    {
        self.subscribe(move |conn, event| {
            if let ConnectionEvent::MessageReceived(message) = event {
                handler(conn, message)
            }
        })
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection<M>, &AppError) + Send + Sync + 'static,
    {
        self.subscribe(move |conn, event| {
            if let ConnectionEvent::Error(error) = event {
                handler(conn, error)
            }
        })
    }

    pub fn on_life_check<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection<M>) + Send + Sync + 'static,
    {
        self.subscribe(move |conn, event| {
            if let ConnectionEvent::LifeCheck = event {
                handler(conn)
            }
        })
    }

    fn emit(&self, event: ConnectionEvent<'_, M>) {
        trace!(connection_id = self.inner.id, event = event.name(), "raising event");
        for handler in self.inner.subscribers.snapshot() {
            handler(self, event);
        }
    }

    fn emit_error(&self, error: AppError) {
        warn!(connection_id = self.inner.id, "connection error: {}", error);
        self.emit(ConnectionEvent::Error(&error));
    }
}

impl<M: MessageModel> Endpoint<M> for Connection<M> {
    fn status(&self) -> Status {
        *self.inner.status.lock()
    }

    /// `Disconnected` can only be reached through
    /// [`send_disconnect_message`](Connection::send_disconnect_message).
    fn set_status(&self, status: Status) -> AppResult<()> {
        if status == Status::Disconnected {
            return Err(AppError::InvalidValue(
                "use send_disconnect_message to disconnect".into(),
            ));
        }
        self.set_status_internal(status)
    }

    fn heartbeat_enabled(&self) -> bool {
        self.inner.heartbeat_enabled.load(Ordering::Acquire)
    }

    fn default_messages(&self) -> DefaultMessages<M> {
        self.inner.defaults.read().clone()
    }

    fn set_default_messages(&self, defaults: DefaultMessages<M>) {
        *self.inner.defaults.write() = defaults;
    }
}

impl<M: MessageModel> Drop for Inner<M> {
    fn drop(&mut self) {
        debug!(connection_id = self.id, "connection dropped");
    }
}
