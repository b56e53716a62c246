//! Scriptable in-memory transport for tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::channel::mpsc;
use improv_proto::{Characteristic, DeviceState, ErrorCode, Frame};
use tokio::time::Instant;

use crate::transport::{Notification, NotificationStream, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub at: Instant,
    pub characteristic: Characteristic,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Shared {
    writes: Vec<RecordedWrite>,
    disconnected: bool,
    /// Reads and writes never complete
    stalled: bool,
}

pub struct MockTransport {
    values: HashMap<Characteristic, Vec<u8>>,
    shared: Arc<Mutex<Shared>>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    fail_writes: bool,
}

/// The device side of a `MockTransport`
pub struct Feed {
    tx: Option<mpsc::UnboundedSender<Notification>>,
    shared: Arc<Mutex<Shared>>,
}

impl MockTransport {
    pub fn new(capabilities: u8, state: DeviceState) -> (Self, Feed) {
        let (tx, rx) = mpsc::unbounded();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let values = HashMap::from([
            (Characteristic::Capabilities, vec![capabilities]),
            (Characteristic::CurrentState, vec![state.as_byte()]),
            (Characteristic::ErrorState, vec![ErrorCode::NoError.as_byte()]),
        ]);
        let transport = Self {
            values,
            shared: shared.clone(),
            notifications: Some(rx),
            fail_writes: false,
        };
        (transport, Feed { tx: Some(tx), shared })
    }

    pub fn remove(&mut self, characteristic: Characteristic) {
        self.values.remove(&characteristic);
    }

    pub fn set(&mut self, characteristic: Characteristic, value: Vec<u8>) {
        self.values.insert(characteristic, value);
    }

    pub fn fail_writes(&mut self) {
        self.fail_writes = true;
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.shared.lock().unwrap().writes.clone()
    }

    fn stalled(&self) -> bool {
        self.shared.lock().unwrap().stalled
    }
}

impl Transport for MockTransport {
    async fn read(
        &mut self,
        characteristic: Characteristic,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        if self.stalled() {
            std::future::pending::<()>().await;
        }
        Ok(self.values.get(&characteristic).cloned())
    }

    async fn write(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if self.stalled() {
            std::future::pending::<()>().await;
        }
        let mut shared = self.shared.lock().unwrap();
        if shared.disconnected {
            return Err(TransportError::NotConnected);
        }
        if self.fail_writes {
            return Err(TransportError::Write(characteristic, "injected failure".to_string()));
        }
        shared.writes.push(RecordedWrite {
            at: Instant::now(),
            characteristic,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(
        &mut self,
        _characteristics: &[Characteristic],
    ) -> Result<NotificationStream, TransportError> {
        self.notifications
            .take()
            .map(|rx| rx.boxed())
            .ok_or_else(|| TransportError::Subscribe("already subscribed".to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.shared.lock().unwrap().disconnected = true;
        Ok(())
    }
}

impl Feed {
    pub fn push(&self, characteristic: Characteristic, value: impl Into<Vec<u8>>) {
        if let Some(tx) = &self.tx {
            let _ = tx.unbounded_send(Notification::new(characteristic, value));
        }
    }

    pub fn state(&self, state: DeviceState) {
        self.push(Characteristic::CurrentState, vec![state.as_byte()]);
    }

    pub fn error(&self, code: ErrorCode) {
        self.push(Characteristic::ErrorState, vec![code.as_byte()]);
    }

    pub fn result(&self, frame: &Frame) {
        self.push(Characteristic::RpcResult, frame.to_bytes().unwrap());
    }

    /// Make every further read and write hang
    pub fn stall(&self) {
        self.shared.lock().unwrap().stalled = true;
    }

    /// End the notification stream, as a dropped BLE link does
    pub fn drop_link(&mut self) {
        self.tx = None;
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.shared.lock().unwrap().writes.clone()
    }

    pub fn disconnected(&self) -> bool {
        self.shared.lock().unwrap().disconnected
    }
}
