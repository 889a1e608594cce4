mod message;
mod network;
mod service;

pub use message::MessageModel;
pub use network::{
    Client, Connection, ConnectionEvent, ConnectionHandler, DefaultMessages, Endpoint, Frame,
    FrameReader, Status, SubscriptionId, HEADER_LEN, MAX_PAYLOAD_LEN,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BridgeConfig, ConnectionConfig,
    EventSender, LogGuard, NetworkConfig, Server, ServerConfig, ServerEvent, ServerHandler,
    Shutdown, ShutdownNotifier, ENV_PREFIX,
};
