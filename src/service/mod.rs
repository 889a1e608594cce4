pub use app_error::{AppError, AppResult};
pub use self::config::{
    BridgeConfig, ConnectionConfig, NetworkConfig, ServerConfig, ENV_PREFIX,
};
pub use server::{EventSender, Server, ServerEvent, ServerHandler};
pub use shutdown::{Shutdown, ShutdownNotifier};
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod server;
mod shutdown;
mod tracing_config;
