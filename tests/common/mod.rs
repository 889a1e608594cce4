#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use rstest::fixture;
use talkbridge::{setup_local_tracing, AppError, AppResult, ConnectionConfig, Frame, MessageModel};
use tokio::sync::mpsc;
use tokio::time;

#[fixture]
#[once]
pub fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

/// Raw payload model; rejects payloads starting with `!` to exercise load failures.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TestMessage(pub Vec<u8>);

impl TestMessage {
    pub fn text(text: &str) -> Self {
        TestMessage(text.as_bytes().to_vec())
    }
}

impl MessageModel for TestMessage {
    fn load(&mut self, payload: &[u8]) -> AppResult<()> {
        if payload.first() == Some(&b'!') {
            return Err(AppError::CorruptMessage("payload starts with '!'".into()));
        }
        self.0 = payload.to_vec();
        Ok(())
    }

    fn get_bytes(&self) -> AppResult<Bytes> {
        Ok(Frame::encode(&self.0)?.freeze())
    }
}

/// Short timings so heartbeat and disconnect tests run quickly.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_interval_ms: 50,
        disconnect_grace_ms: 50,
        accepted_io_timeout_ms: 2_000,
        dial_buffer_size: 1024,
    }
}

pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(5), async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
