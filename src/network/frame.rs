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

use std::io::{self, ErrorKind};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;

use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Length of the ASCII decimal header in front of every payload.
pub const HEADER_LEN: usize = 4;
/// Largest payload a 4-digit header can describe.
pub const MAX_PAYLOAD_LEN: usize = 9999;

/// One payload read off the wire, header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: BytesMut,
}

impl Frame {
    /// Header for a payload of `len` bytes, zero padded to 4 digits.
    pub fn header(len: usize) -> AppResult<[u8; HEADER_LEN]> {
        if len > MAX_PAYLOAD_LEN {
            return Err(AppError::MessageTooLarge(format!(
                "payload of {} bytes exceeds the {} byte frame limit",
                len, MAX_PAYLOAD_LEN
            )));
        }
        let mut header = [b'0'; HEADER_LEN];
        let mut rest = len;
        for digit in header.iter_mut().rev() {
            *digit = b'0' + (rest % 10) as u8;
            rest /= 10;
        }
        Ok(header)
    }

    /// Header followed by `payload`, ready to be written to a socket.
    pub fn encode(payload: &[u8]) -> AppResult<BytesMut> {
        let header = Frame::header(payload.len())?;
        let mut buffer = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buffer.put_slice(&header);
        buffer.put_slice(payload);
        Ok(buffer)
    }

    fn parse_header(header: &[u8]) -> AppResult<usize> {
        if !header.iter().all(u8::is_ascii_digit) {
            return Err(AppError::MalformedProtocol(format!(
                "frame header {:?} is not a 4 digit decimal length",
                String::from_utf8_lossy(header)
            )));
        }
        Ok(header
            .iter()
            .fold(0usize, |len, digit| len * 10 + (digit - b'0') as usize))
    }

    /// Checks whether `buffer` holds a complete frame and returns its payload
    /// length. A malformed header is consumed from the buffer before the error is
    /// returned, so the next call starts on the following bytes.
    pub fn check(buffer: &mut BytesMut) -> AppResult<usize> {
        if buffer.remaining() < HEADER_LEN {
            return Err(Incomplete);
        }
        let body_size = match Frame::parse_header(&buffer[..HEADER_LEN]) {
            Ok(size) => size,
            Err(e) => {
                buffer.advance(HEADER_LEN);
                return Err(e);
            }
        };
        if buffer.remaining() < body_size + HEADER_LEN {
            buffer.reserve(body_size + HEADER_LEN - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(body_size)
    }

    pub fn parse(buffer: &mut BytesMut) -> AppResult<Option<Frame>> {
        match Frame::check(buffer) {
            Ok(body_size) => {
                buffer.advance(HEADER_LEN);
                let payload = buffer.split_to(body_size);
                Ok(Some(Frame { payload }))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Reads frames from the receiving half of a socket.
///
/// Waiting for the first byte of a frame is unbounded. Once a frame has started,
/// the remaining reads are bounded by `frame_timeout` when one is set.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    frame_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, frame_timeout: Option<Duration>) -> FrameReader<R> {
        FrameReader {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            frame_timeout,
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `None` when the peer closed the connection between two frames, and
    /// an error when it closed it in the middle of one. Cancel safe: bytes already
    /// read stay buffered for the next call.
    pub async fn read_frame(&mut self) -> AppResult<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            let read = match (self.frame_timeout, self.buffer.is_empty()) {
                (Some(limit), false) => {
                    time::timeout(limit, self.reader.read_buf(&mut self.buffer))
                        .await
                        .map_err(|_| {
                            AppError::Timeout(format!(
                                "frame not completed within {:?}, {} bytes buffered",
                                limit,
                                self.buffer.len()
                            ))
                        })??
                }
                _ => self.reader.read_buf(&mut self.buffer).await?,
            };
            if 0 == read {
                return if self.buffer.is_empty() {
                    // peer has closed the connection gracefully
                    Ok(None)
                } else {
                    // peer closed the connection while sending a frame
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }

    /// Drops a partially received frame, e.g. after a timeout.
    pub fn discard_partial(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}
