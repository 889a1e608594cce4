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

use std::ops::Deref;

use super::Connection;
use crate::{AppResult, BridgeConfig, ConnectionConfig, MessageModel};

/// A connection that dials a fixed remote address.
///
/// Dereferences to [`Connection`] for sending, subscribing and disconnecting.
#[derive(Debug, Clone)]
pub struct Client<M: MessageModel> {
    connection: Connection<M>,
    address: String,
    port: u16,
}

impl<M: MessageModel> Client<M> {
    pub fn new(address: impl Into<String>, port: u16) -> Client<M> {
        Self::with_config(address, port, ConnectionConfig::default())
    }

    pub fn with_config(address: impl Into<String>, port: u16, config: ConnectionConfig) -> Client<M> {
        Client {
            connection: Connection::with_config(config),
            address: address.into(),
            port,
        }
    }

    /// Targets `network.ip:network.port` of `config`.
    pub fn from_config(config: &BridgeConfig) -> Client<M> {
        Self::with_config(
            config.network.ip.clone(),
            config.network.port,
            config.connection.clone(),
        )
    }

    pub async fn connect(&self, heartbeat_enabled: bool) -> AppResult<()> {
        self.connection
            .build_bridge(&self.address, self.port, heartbeat_enabled)
            .await
    }

    pub fn remote_address(&self) -> &str {
        &self.address
    }

    pub fn remote_port(&self) -> u16 {
        self.port
    }

    pub fn connection(&self) -> &Connection<M> {
        &self.connection
    }
}

impl<M: MessageModel> Deref for Client<M> {
    type Target = Connection<M>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}
