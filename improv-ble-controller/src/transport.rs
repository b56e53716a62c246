//! The slice of a BLE link the provisioning engine needs
//!
//! Writes are never paired with a reply at this level: the effect of a write
//! is only ever observed through a later notification or read.

use futures::stream::BoxStream;
use improv_proto::Characteristic;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("write to {0:?} failed: {1}")]
    Write(Characteristic, String),
    #[error("read from {0:?} failed: {1}")]
    Read(Characteristic, String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("ble: {0}")]
    Ble(String),
}

/// A value pushed by the device on one of the notify characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Characteristic,
    pub value: Vec<u8>,
}

impl Notification {
    pub fn new(characteristic: Characteristic, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            value: value.into(),
        }
    }
}

/// Order-preserving feed of every subscribed characteristic. The stream
/// ending means the link is gone.
pub type NotificationStream = BoxStream<'static, Notification>;

#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Read a characteristic, `None` if the device does not expose it
    async fn read(
        &mut self,
        characteristic: Characteristic,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    async fn write(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Subscribe to `characteristics` and return a single merged stream
    async fn subscribe(
        &mut self,
        characteristics: &[Characteristic],
    ) -> Result<NotificationStream, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
