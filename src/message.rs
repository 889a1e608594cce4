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

use bytes::Bytes;

use crate::AppResult;

/// An application message exchanged over a connection.
///
/// The receive side builds a fresh `Default` value for every frame and calls
/// [`load`](MessageModel::load) with the frame payload, the 4-byte length header
/// already stripped. The send side writes whatever
/// [`get_bytes`](MessageModel::get_bytes) returns untouched, so it must include
/// the length header; [`Frame::encode`](crate::Frame::encode) produces it.
///
/// ```
/// use bytes::Bytes;
/// use talkbridge::Frame;
/// use talkbridge::{AppError, AppResult, MessageModel};
///
/// #[derive(Debug, Default, Clone)]
/// struct Text(String);
///
/// impl MessageModel for Text {
///     fn load(&mut self, payload: &[u8]) -> AppResult<()> {
///         self.0 = String::from_utf8(payload.to_vec())
///             .map_err(|e| AppError::CorruptMessage(e.to_string()))?;
///         Ok(())
///     }
///
///     fn get_bytes(&self) -> AppResult<Bytes> {
///         Ok(Frame::encode(self.0.as_bytes())?.freeze())
///     }
/// }
///
/// let bytes = Text("ABCD".into()).get_bytes().unwrap();
/// assert_eq!(&bytes[..], b"0004ABCD");
/// ```
pub trait MessageModel: Default + Clone + Send + Sync + 'static {
    /// Populates the model from a received payload.
    fn load(&mut self, payload: &[u8]) -> AppResult<()>;

    /// Wire-ready bytes, length header included.
    fn get_bytes(&self) -> AppResult<Bytes>;

    fn from_payload(payload: &[u8]) -> AppResult<Self> {
        let mut model = Self::default();
        model.load(payload)?;
        Ok(model)
    }
}
