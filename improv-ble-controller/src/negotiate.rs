//! Capability negotiation, run once per session before any command is sent

use improv_proto::{Capabilities, Characteristic, DeviceState, ErrorCode};
use log::debug;

use crate::device::DeviceHandle;
use crate::transport::{Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// Not a provisioning target. Permanent, never retried.
    #[error("device is not an Improv provisioning target: {0}")]
    Unsupported(String),
    #[error("{0}")]
    AlreadyNegotiated(#[from] crate::device::CapabilitiesAlreadySet),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What the device reported when the session started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub capabilities: Capabilities,
    pub state: DeviceState,
    pub error: ErrorCode,
}

/// Read capabilities and the initial state, and record the capabilities on `device`
pub async fn negotiate<T: Transport>(
    transport: &mut T,
    device: &mut DeviceHandle,
) -> Result<Negotiated, NegotiationError> {
    let capabilities = match transport.read(Characteristic::Capabilities).await? {
        None => {
            return Err(NegotiationError::Unsupported(
                "capabilities characteristic missing".to_string(),
            ));
        }
        Some(value) => match value.first() {
            None => {
                return Err(NegotiationError::Unsupported(
                    "capabilities characteristic is empty".to_string(),
                ));
            }
            Some(b) => Capabilities::from_bits(*b),
        },
    };
    if capabilities.is_empty() {
        return Err(NegotiationError::Unsupported(
            "device reports no capabilities".to_string(),
        ));
    }

    let state = match transport.read(Characteristic::CurrentState).await? {
        None => {
            return Err(NegotiationError::Unsupported(
                "current state characteristic missing".to_string(),
            ));
        }
        Some(value) => DeviceState::from_value(&value).ok_or_else(|| {
            NegotiationError::Unsupported(format!("invalid current state {value:02x?}"))
        })?,
    };

    // the error characteristic is informational here, absent means no error
    let error = transport
        .read(Characteristic::ErrorState)
        .await?
        .and_then(|v| ErrorCode::from_value(&v))
        .unwrap_or(ErrorCode::NoError);

    device.set_capabilities(capabilities)?;
    debug!(
        "{device}: capabilities=0x{:02x} state={state:?} error={error}",
        capabilities.bits()
    );

    Ok(Negotiated {
        capabilities,
        state,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    #[tokio::test]
    async fn reads_capabilities_and_state() {
        let (mut transport, _feed) = MockTransport::new(0x03, DeviceState::Authorized);
        let mut device = DeviceHandle::new("AA:00", "dev");

        let negotiated = negotiate(&mut transport, &mut device).await.unwrap();
        assert_eq!(negotiated.state, DeviceState::Authorized);
        assert_eq!(negotiated.error, ErrorCode::NoError);
        assert!(device.supports(Capabilities::IDENTIFY | Capabilities::PROVISION));
    }

    #[tokio::test]
    async fn missing_capabilities_is_unsupported() {
        let (mut transport, _feed) = MockTransport::new(0x03, DeviceState::Authorized);
        transport.remove(Characteristic::Capabilities);
        let mut device = DeviceHandle::new("AA:00", "dev");

        let err = negotiate(&mut transport, &mut device).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Unsupported(_)));
        assert!(!device.is_negotiated());
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn zero_capabilities_is_unsupported() {
        let (mut transport, _feed) = MockTransport::new(0x00, DeviceState::Authorized);
        let mut device = DeviceHandle::new("AA:00", "dev");

        let err = negotiate(&mut transport, &mut device).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Unsupported(_)));
    }

    #[tokio::test]
    async fn garbage_current_state_is_unsupported() {
        let (mut transport, _feed) = MockTransport::new(0x01, DeviceState::Authorized);
        transport.set(Characteristic::CurrentState, vec![0x99]);
        let mut device = DeviceHandle::new("AA:00", "dev");

        let err = negotiate(&mut transport, &mut device).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Unsupported(_)));
    }
}
