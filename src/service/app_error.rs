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

use std::io;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// wire protocol errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// the disconnect sequence could not close the socket cleanly
    #[error("host has disconnected: {0}")]
    HostDisconnected(#[source] Box<AppError>),

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Whether the error means the transport can no longer be used.
    pub fn is_transport_lost(&self) -> bool {
        match self {
            AppError::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            ),
            AppError::HostDisconnected(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_disconnected_keeps_its_source() {
        let inner = AppError::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let err = AppError::HostDisconnected(Box::new(inner));
        assert!(err.to_string().starts_with("host has disconnected"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("io error: pipe"));
    }

    #[test]
    fn reset_is_transport_loss_but_timeout_is_not() {
        let reset = AppError::IoError(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_transport_lost());
        assert!(!AppError::Timeout("frame".into()).is_transport_lost());
        assert!(!AppError::MalformedProtocol("header".into()).is_transport_lost());
    }
}
