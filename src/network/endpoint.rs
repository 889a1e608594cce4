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

use crate::{AppError, AppResult, MessageModel};

/// Lifecycle of an endpoint.
///
/// Only `Connected -> Disconnected` is driven by the engine. `Validated` and
/// `InSession` are set by the application and never interpreted here.
/// `Disconnected` is terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Connected,
    Disconnected,
    Validated,
    InSession,
}

impl Status {
    /// Validates moving from `self` to `next`.
    pub fn transition(self, next: Status) -> AppResult<Status> {
        match (self, next) {
            (Status::Disconnected, Status::Disconnected) => Ok(next),
            (Status::Disconnected, _) => Err(AppError::IllegalStateError(format!(
                "cannot move a disconnected endpoint to {}",
                next
            ))),
            _ => Ok(next),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Connected => "connected",
            Status::Disconnected => "disconnected",
            Status::Validated => "validated",
            Status::InSession => "in_session",
        };
        f.write_str(name)
    }
}

/// Messages used by the handshake and the heartbeat.
#[derive(Debug, Clone)]
pub struct DefaultMessages<M> {
    pub sign_on: Option<M>,
    pub sign_off: Option<M>,
    pub heartbeat: Option<M>,
}

impl<M> DefaultMessages<M> {
    pub fn new(sign_on: Option<M>, sign_off: Option<M>, heartbeat: Option<M>) -> Self {
        DefaultMessages {
            sign_on,
            sign_off,
            heartbeat,
        }
    }
}

impl<M> Default for DefaultMessages<M> {
    fn default() -> Self {
        DefaultMessages {
            sign_on: None,
            sign_off: None,
            heartbeat: None,
        }
    }
}

/// Surface shared by connections and the server.
pub trait Endpoint<M: MessageModel> {
    fn status(&self) -> Status;

    /// Fails once the endpoint is `Disconnected`.
    fn set_status(&self, status: Status) -> AppResult<()>;

    fn heartbeat_enabled(&self) -> bool;

    fn default_messages(&self) -> DefaultMessages<M>;

    /// Takes effect for bridges built afterwards.
    fn set_default_messages(&self, defaults: DefaultMessages<M>);

    fn is_disconnected(&self) -> bool {
        self.status() == Status::Disconnected
    }
}
