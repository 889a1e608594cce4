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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, trace, warn};

use super::{Shutdown, ShutdownNotifier};
use crate::network::{
    Connection, ConnectionEvent, DefaultMessages, Endpoint, Status, SubscriptionId, Subscribers,
};
use crate::{AppError, AppResult, BridgeConfig, ConnectionConfig, MessageModel, ServerConfig};

const MAX_ACCEPT_BACKOFF_SECS: u64 = 64;

/// Who raised a server event.
pub enum EventSender<'a, M: MessageModel> {
    Server(&'a Server<M>),
    Connection(&'a Connection<M>),
}

impl<M: MessageModel> Clone for EventSender<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: MessageModel> Copy for EventSender<'_, M> {}

impl<M: MessageModel> EventSender<'_, M> {
    pub fn connection(&self) -> Option<&Connection<M>> {
        match self {
            EventSender::Connection(connection) => Some(connection),
            EventSender::Server(_) => None,
        }
    }
}

/// Events of accepted connections re-raised by the server, plus its own.
pub enum ServerEvent<'a, M: MessageModel> {
    SignOn(&'a M),
    SignOff(Option<&'a M>),
    MessageReceived(&'a M),
    Error(&'a AppError),
    LifeCheck(&'a Connection<M>),
    ClientConnected(&'a Connection<M>),
}

impl<M: MessageModel> Clone for ServerEvent<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: MessageModel> Copy for ServerEvent<'_, M> {}

impl<'a, M: MessageModel> ServerEvent<'a, M> {
    fn forwarded(connection: &'a Connection<M>, event: ConnectionEvent<'a, M>) -> Self {
        match event {
            ConnectionEvent::SignOn(message) => ServerEvent::SignOn(message),
            ConnectionEvent::SignOff(message) => ServerEvent::SignOff(message),
            ConnectionEvent::MessageReceived(message) => ServerEvent::MessageReceived(message),
            ConnectionEvent::Error(error) => ServerEvent::Error(error),
            ConnectionEvent::LifeCheck => ServerEvent::LifeCheck(connection),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SignOn(_) => "sign_on",
            ServerEvent::SignOff(_) => "sign_off",
            ServerEvent::MessageReceived(_) => "message_received",
            ServerEvent::Error(_) => "error",
            ServerEvent::LifeCheck(_) => "life_check",
            ServerEvent::ClientConnected(_) => "client_connected",
        }
    }
}

/// Callback registered with [`Server::subscribe`].
pub type ServerHandler<M> = dyn Fn(EventSender<'_, M>, ServerEvent<'_, M>) + Send + Sync;

struct Listening {
    local_addr: SocketAddr,
    shutdown: ShutdownNotifier,
    handle: JoinHandle<()>,
}

struct ServerInner<M: MessageModel> {
    ip: String,
    port: u16,
    connection_config: ConnectionConfig,
    server_config: ServerConfig,
    status: Mutex<Status>,
    heartbeat_enabled: AtomicBool,
    defaults: RwLock<DefaultMessages<M>>,
    listening: tokio::sync::Mutex<Option<Listening>>,
    local_addr: Mutex<Option<SocketAddr>>,
    active_connections: Mutex<Vec<Connection<M>>>,
    subscribers: Subscribers<ServerHandler<M>>,
}

/// Accepts connections and republishes their events.
///
/// Every accepted socket becomes a [`Connection`] carrying the server's default
/// messages and heartbeat flag. Its five events are re-raised as server events
/// with the connection as sender, so one subscription observes all clients.
///
/// Accepted connections are never evicted from
/// [`active_connections`](Server::active_connections) when they disconnect.
pub struct Server<M: MessageModel> {
    inner: Arc<ServerInner<M>>,
}

impl<M: MessageModel> Clone for Server<M> {
    fn clone(&self) -> Self {
        Server {
            inner: self.inner.clone(),
        }
    }
}

impl<M: MessageModel> fmt::Debug for Server<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("ip", &self.inner.ip)
            .field("port", &self.inner.port)
            .field("listening", &self.is_listening())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl<M: MessageModel> Server<M> {
    pub fn new(ip: impl Into<String>, port: u16) -> Server<M> {
        Self::with_config(ip, port, ConnectionConfig::default(), ServerConfig::default())
    }

    pub fn with_config(
        ip: impl Into<String>,
        port: u16,
        connection_config: ConnectionConfig,
        server_config: ServerConfig,
    ) -> Server<M> {
        Server {
            inner: Arc::new(ServerInner {
                ip: ip.into(),
                port,
                connection_config,
                server_config,
                status: Mutex::new(Status::Connected),
                heartbeat_enabled: AtomicBool::new(false),
                defaults: RwLock::new(DefaultMessages::default()),
                listening: tokio::sync::Mutex::new(None),
                local_addr: Mutex::new(None),
                active_connections: Mutex::new(Vec::new()),
                subscribers: Subscribers::new(),
            }),
        }
    }

    /// Listens on `network.ip:network.port` with the heartbeat flag of `config`.
    pub fn from_config(config: &BridgeConfig) -> Server<M> {
        let server = Self::with_config(
            config.network.ip.clone(),
            config.network.port,
            config.connection.clone(),
            config.server.clone(),
        );
        server.set_heartbeat_enabled(config.network.heartbeat_enabled);
        server
    }

    /// Heartbeat flag handed to connections accepted from now on.
    pub fn set_heartbeat_enabled(&self, enabled: bool) {
        self.inner.heartbeat_enabled.store(enabled, Ordering::Release);
    }

    pub fn is_listening(&self) -> bool {
        self.inner.local_addr.lock().is_some()
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn active_connections(&self) -> Vec<Connection<M>> {
        self.inner.active_connections.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.active_connections.lock().len()
    }

    /// Binds and starts accepting. Calling it again while listening returns the
    /// bound address without binding a second time.
    pub async fn start_listener(&self) -> AppResult<SocketAddr> {
        let mut listening = self.inner.listening.lock().await;
        if let Some(current) = listening.as_ref() {
            return Ok(current.local_addr);
        }

        let listener = match TcpListener::bind((self.inner.ip.as_str(), self.inner.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind server to address: {}:{} - Error: {}",
                    self.inner.ip, self.inner.port, err
                );
                error!(error_msg);
                return Err(AppError::IllegalStateError(error_msg));
            }
        };
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);
        {
            let mut status = self.inner.status.lock();
            *status = status.transition(Status::Connected)?;
        }

        let shutdown = ShutdownNotifier::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(&self.inner),
            shutdown.subscribe(),
        ));
        *listening = Some(Listening {
            local_addr,
            shutdown,
            handle,
        });
        *self.inner.local_addr.lock() = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops accepting new sockets. Does nothing when not listening.
    ///
    /// Accepted connections keep running unless `close_connections_on_stop` is
    /// set, in which case each of them is signed off with `sign_off`.
    pub async fn stop_listener(&self, sign_off: Option<M>) {
        let Some(current) = self.inner.listening.lock().await.take() else {
            return;
        };
        *self.inner.local_addr.lock() = None;
        current.shutdown.trigger();
        if let Err(e) = current.handle.await {
            warn!("accept loop ended abnormally: {}", e);
        }
        info!("tcp server stopped listening on {}", current.local_addr);

        if self.inner.server_config.close_connections_on_stop {
            let mut closing = JoinSet::new();
            for connection in self.active_connections() {
                let sign_off = sign_off.clone();
                closing.spawn(async move { connection.send_disconnect_message(sign_off).await });
            }
            while closing.join_next().await.is_some() {}
        }
    }

    fn on_accepted(&self, socket: TcpStream, peer: SocketAddr) {
        debug!("accept new connection from {}", peer);
        let accepted = {
            let mut active = self.inner.active_connections.lock();
            self.check_capacity(&active, peer)
                .and_then(|()| self.wire_connection(socket))
                .inspect(|connection| {
                    active.push(connection.clone());
                })
        };
        match accepted {
            Ok(connection) => {
                info!(connection_id = connection.id(), "client connected from {}", peer);
                self.emit(EventSender::Server(self), ServerEvent::ClientConnected(&connection));
            }
            Err(e) => self.emit_error(e),
        }
    }

    /// Disconnected connections stay listed but do not count against the limit.
    fn check_capacity(&self, active: &[Connection<M>], peer: SocketAddr) -> AppResult<()> {
        let limit = self.inner.server_config.max_connections;
        if limit == 0 {
            return Ok(());
        }
        let live = active.iter().filter(|c| !c.is_disconnected()).count();
        if live >= limit {
            return Err(AppError::Accept(format!(
                "connection limit of {} reached, refusing {}",
                limit, peer
            )));
        }
        Ok(())
    }

    fn wire_connection(&self, socket: TcpStream) -> AppResult<Connection<M>> {
        let connection = Connection::with_config(self.inner.connection_config.clone());
        connection.set_default_messages(self.default_messages());
        // wired before the tasks start so no early event is missed
        self.forward_events(&connection);
        connection.build_bridge_accepted(socket, self.heartbeat_enabled())?;
        Ok(connection)
    }

    fn forward_events(&self, connection: &Connection<M>) {
        let server = Arc::downgrade(&self.inner);
        connection.subscribe(move |conn, event| {
            let Some(inner) = server.upgrade() else {
                return;
            };
            let server = Server { inner };
            server.emit(
                EventSender::Connection(conn),
                ServerEvent::forwarded(conn, event),
            );
        });
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(EventSender<'_, M>, ServerEvent<'_, M>) + Send + Sync + 'static,
    {
        self.inner.subscribers.add(Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.remove(id)
    }

    pub fn on_client_connected<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Connection<M>) + Send + Sync + 'static,
    {
        self.subscribe(move |_, event| {
            if let ServerEvent::ClientConnected(connection) = event {
                handler(connection)
            }
        })
    }

    pub fn on_message_received<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(EventSender<'_, M>, &M) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ServerEvent::MessageReceived(message) = event {
                handler(sender, message)
            }
        })
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(EventSender<'_, M>, &AppError) + Send + Sync + 'static,
    {
        self.subscribe(move |sender, event| {
            if let ServerEvent::Error(error) = event {
                handler(sender, error)
            }
        })
    }

    fn emit(&self, sender: EventSender<'_, M>, event: ServerEvent<'_, M>) {
        trace!(event = event.name(), "raising server event");
        for handler in self.inner.subscribers.snapshot() {
            handler(sender, event);
        }
    }

    fn emit_error(&self, error: AppError) {
        error!("server error: {}", error);
        self.emit(EventSender::Server(self), ServerEvent::Error(&error));
    }
}

impl<M: MessageModel> Endpoint<M> for Server<M> {
    fn status(&self) -> Status {
        *self.inner.status.lock()
    }

    fn set_status(&self, status: Status) -> AppResult<()> {
        let mut current = self.inner.status.lock();
        *current = current.transition(status)?;
        Ok(())
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

impl<M: MessageModel> Drop for ServerInner<M> {
    fn drop(&mut self) {
        if let Some(current) = self.listening.get_mut().take() {
            current.shutdown.trigger();
        }
        debug!("tcp server dropped");
    }
}

/// Accepts until the shutdown signal fires or the server is dropped.
///
/// A failed accept is reported and retried after a backoff, doubling from one
/// second up to a minute; it never ends the loop.
async fn accept_loop<M: MessageModel>(
    listener: TcpListener,
    server: Weak<ServerInner<M>>,
    mut shutdown: Shutdown,
) {
    let mut backoff = 1;
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.recv() => {
                debug!("accept loop received shutdown signal");
                break;
            }
        };
        let Some(inner) = server.upgrade() else {
            break;
        };
        let current = Server { inner };
        match accepted {
            Ok((socket, peer)) => {
                backoff = 1;
                current.on_accepted(socket, peer);
            }
            Err(err) => {
                current.emit_error(AppError::Accept(err.to_string()));
                drop(current);
                tokio::select! {
                    _ = time::sleep(Duration::from_secs(backoff)) => {}
                    _ = shutdown.recv() => break,
                }
                backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF_SECS);
            }
        }
    }
    debug!("accept loop exited");
}
