//! Outcome mapping: every terminal state resolves to exactly one user-facing key

use improv_proto::ErrorCode;
use serde::Serialize;

use crate::ble::DiscoveryError;
use crate::session::{FailureReason, State};

/// Closed set of abort/result reasons shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// Device is provisioned and this controller already manages it
    AlreadyConfigured,
    /// Device could not join the network
    CannotConnect,
    /// Device does not expose a usable Improv service
    CharacteristicMissing,
    NoDevicesFound,
    ProvisionSuccessful,
    ProvisionSuccessfulUrl { url: String },
    Unknown,
}

impl Outcome {
    pub fn key(&self) -> &'static str {
        match self {
            Outcome::AlreadyConfigured => "already_configured",
            Outcome::CannotConnect => "cannot_connect",
            Outcome::CharacteristicMissing => "characteristic_missing",
            Outcome::NoDevicesFound => "no_devices_found",
            Outcome::ProvisionSuccessful => "provision_successful",
            Outcome::ProvisionSuccessfulUrl { .. } => "provision_successful_url",
            Outcome::Unknown => "unknown",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::ProvisionSuccessful | Outcome::ProvisionSuccessfulUrl { .. })
    }

    pub fn from_error_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::UnableToConnect => Outcome::CannotConnect,
            ErrorCode::NoError
            | ErrorCode::InvalidRpcPacket
            | ErrorCode::UnknownRpcCommand
            | ErrorCode::NotAuthorized
            | ErrorCode::BadHostname
            | ErrorCode::Unknown
            | ErrorCode::Other(_) => Outcome::Unknown,
        }
    }

    pub fn from_failure(reason: &FailureReason) -> Self {
        match reason {
            FailureReason::AlreadyConfigured => Outcome::AlreadyConfigured,
            FailureReason::CharacteristicMissing => Outcome::CharacteristicMissing,
            FailureReason::NoDevicesFound => Outcome::NoDevicesFound,
            FailureReason::Device(code) => Self::from_error_code(*code),
            // the reason itself stays on the session so callers can still tell these apart
            FailureReason::Timeout | FailureReason::Cancelled | FailureReason::Transport(_) => {
                Outcome::Unknown
            }
        }
    }

    pub fn from_success(url: Option<&str>) -> Self {
        match url {
            Some(url) => Outcome::ProvisionSuccessfulUrl { url: url.to_string() },
            None => Outcome::ProvisionSuccessful,
        }
    }

    /// `None` while the session has not reached a terminal state
    pub fn from_state(state: &State) -> Option<Self> {
        match state {
            State::Succeeded { url } => Some(Self::from_success(url.as_deref())),
            State::Failed(reason) => Some(Self::from_failure(reason)),
            _ => None,
        }
    }

    pub fn from_discovery_error(err: &DiscoveryError) -> Self {
        match err {
            DiscoveryError::NoDevicesFound | DiscoveryError::NotFound(_) => {
                Self::from_failure(&FailureReason::NoDevicesFound)
            }
            _ => Outcome::Unknown,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::ProvisionSuccessfulUrl { url } => write!(f, "{} ({url})", self.key()),
            other => f.write_str(other.key()),
        }
    }
}
