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

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Prefix of the environment variables that override file values,
/// e.g. `TALKBRIDGE__NETWORK__PORT=7100`.
pub const ENV_PREFIX: &str = "TALKBRIDGE";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Propagated to every connection the server accepts.
    pub heartbeat_enabled: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 7100,
            heartbeat_enabled: false,
        }
    }
}

/// Timing and socket parameters of a single connection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Interval between two heartbeat writes.
    pub heartbeat_interval_ms: u64,
    /// Time given to the sign-off message to drain before the socket is closed.
    pub disconnect_grace_ms: u64,
    /// Write and frame-completion timeout for accepted sockets, 0 disables it.
    pub accepted_io_timeout_ms: u64,
    /// Send and receive buffer size of dialed sockets.
    pub dial_buffer_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            heartbeat_interval_ms: 60_000,
            disconnect_grace_ms: 1_000,
            accepted_io_timeout_ms: 10_000,
            dial_buffer_size: 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
    pub fn accepted_io_timeout(&self) -> Option<Duration> {
        (self.accepted_io_timeout_ms > 0).then(|| Duration::from_millis(self.accepted_io_timeout_ms))
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Send the sign-off to every accepted connection when the listener stops.
    pub close_connections_on_stop: bool,
    /// Accepted connections not yet disconnected, above which new sockets are
    /// refused. 0 means no limit.
    pub max_connections: usize,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub server: ServerConfig,
}

impl BridgeConfig {
    /// Loads the configuration file at `path`, then applies `TALKBRIDGE__*`
    /// environment overrides. Missing keys keep their defaults.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BridgeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let bridge_config: BridgeConfig = config.try_deserialize()?;
        bridge_config.validate()?;

        Ok(bridge_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.connection.heartbeat_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "connection.heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.connection.dial_buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "connection.dial_buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}
