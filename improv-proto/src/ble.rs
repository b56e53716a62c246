//! BLE GATT Service Protocol Constants for Improv Wi-Fi Provisioning
//!
//! This module defines the Improv service/characteristic UUIDs and the single
//! byte values carried by the state, error and capability characteristics.

/// BLE Service UUID: 00467768-6228-2272-4663-277478268000
pub const SERVICE_UUID: &str = "00467768-6228-2272-4663-277478268000";

/// Current State Characteristic UUID (read/notify)
pub const CURRENT_STATE_UUID: &str = "00467768-6228-2272-4663-277478268001";

/// Error State Characteristic UUID (read/notify)
pub const ERROR_STATE_UUID: &str = "00467768-6228-2272-4663-277478268002";

/// RPC Command Characteristic UUID (write)
pub const RPC_COMMAND_UUID: &str = "00467768-6228-2272-4663-277478268003";

/// RPC Result Characteristic UUID (notify)
pub const RPC_RESULT_UUID: &str = "00467768-6228-2272-4663-277478268004";

/// Capabilities Characteristic UUID (read)
pub const CAPABILITIES_UUID: &str = "00467768-6228-2272-4663-277478268005";

const UUID_BASE: u128 = 0x00467768_6228_2272_4663_277478268000;

/// Logical role of an Improv GATT characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Characteristic {
    CurrentState,
    ErrorState,
    RpcCommand,
    RpcResult,
    Capabilities,
}

impl Characteristic {
    /// Characteristics the controller subscribes to after connecting
    pub const NOTIFY: [Characteristic; 3] = [
        Characteristic::CurrentState,
        Characteristic::ErrorState,
        Characteristic::RpcResult,
    ];

    pub const ALL: [Characteristic; 5] = [
        Characteristic::CurrentState,
        Characteristic::ErrorState,
        Characteristic::RpcCommand,
        Characteristic::RpcResult,
        Characteristic::Capabilities,
    ];

    /// 128-bit UUID of this characteristic
    pub const fn as_u128(self) -> u128 {
        UUID_BASE
            + match self {
                Characteristic::CurrentState => 1,
                Characteristic::ErrorState => 2,
                Characteristic::RpcCommand => 3,
                Characteristic::RpcResult => 4,
                Characteristic::Capabilities => 5,
            }
    }

    pub fn from_u128(uuid: u128) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_u128() == uuid)
    }

    pub const fn service_u128() -> u128 {
        UUID_BASE
    }
}

/// RPC command bytes
pub mod commands {
    /// Ask the device to make itself known (blink a LED, beep, ...)
    pub const IDENTIFY: u8 = 0x02;

    /// Send Wi-Fi credentials, payload is `[ssid_len][ssid][pass_len][pass]`
    pub const PROVISION: u8 = 0x03;
}

/// Value of the current state characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceState {
    /// User has to physically confirm on the device before credentials are accepted
    AuthorizationRequired,
    /// Ready to accept credentials
    Authorized,
    /// Credentials received, device is joining the network
    Provisioning,
    /// Device joined the network
    Provisioned,
}

impl DeviceState {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::AuthorizationRequired),
            0x02 => Some(Self::Authorized),
            0x03 => Some(Self::Provisioning),
            0x04 => Some(Self::Provisioned),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::AuthorizationRequired => 0x01,
            Self::Authorized => 0x02,
            Self::Provisioning => 0x03,
            Self::Provisioned => 0x04,
        }
    }

    /// Resting states a device returns to once it is done identifying
    pub fn is_idle(self) -> bool {
        matches!(self, Self::AuthorizationRequired | Self::Authorized)
    }

    /// Decode a characteristic value, which must be exactly one known byte
    pub fn from_value(value: &[u8]) -> Option<Self> {
        match value {
            [b] => Self::from_byte(*b),
            _ => None,
        }
    }
}

/// Value of the error state characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ErrorCode {
    NoError,
    InvalidRpcPacket,
    UnknownRpcCommand,
    /// Device could not join the network with the given credentials
    UnableToConnect,
    NotAuthorized,
    BadHostname,
    Unknown,
    /// Any byte the protocol does not define
    Other(u8),
}

impl ErrorCode {
    /// Every code the protocol defines
    pub const DEFINED: [ErrorCode; 7] = [
        ErrorCode::NoError,
        ErrorCode::InvalidRpcPacket,
        ErrorCode::UnknownRpcCommand,
        ErrorCode::UnableToConnect,
        ErrorCode::NotAuthorized,
        ErrorCode::BadHostname,
        ErrorCode::Unknown,
    ];

    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::NoError,
            0x01 => Self::InvalidRpcPacket,
            0x02 => Self::UnknownRpcCommand,
            0x03 => Self::UnableToConnect,
            0x04 => Self::NotAuthorized,
            0x05 => Self::BadHostname,
            0xFF => Self::Unknown,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::NoError => 0x00,
            Self::InvalidRpcPacket => 0x01,
            Self::UnknownRpcCommand => 0x02,
            Self::UnableToConnect => 0x03,
            Self::NotAuthorized => 0x04,
            Self::BadHostname => 0x05,
            Self::Unknown => 0xFF,
            Self::Other(b) => b,
        }
    }

    pub fn is_error(self) -> bool {
        self != Self::NoError
    }

    pub fn from_value(value: &[u8]) -> Option<Self> {
        match value {
            [b] => Some(Self::from_byte(*b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoError => write!(f, "no error"),
            Self::InvalidRpcPacket => write!(f, "invalid RPC packet"),
            Self::UnknownRpcCommand => write!(f, "unknown RPC command"),
            Self::UnableToConnect => write!(f, "unable to connect"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::BadHostname => write!(f, "bad hostname"),
            Self::Unknown => write!(f, "unknown error"),
            Self::Other(b) => write!(f, "undefined error 0x{b:02x}"),
        }
    }
}

/// Capability bitmap read from the capabilities characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities(u8);

impl Capabilities {
    pub const IDENTIFY: Capabilities = Capabilities(0x01);
    pub const PROVISION: Capabilities = Capabilities(0x02);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bit required before `command` may be sent
    pub fn for_command(command: u8) -> Option<Self> {
        match command {
            commands::IDENTIFY => Some(Self::IDENTIFY),
            commands::PROVISION => Some(Self::PROVISION),
            _ => None,
        }
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characteristic_uuids_match_strings() {
        for c in Characteristic::ALL {
            let s = format!("{:032x}", c.as_u128());
            let dashed = format!(
                "{}-{}-{}-{}-{}",
                &s[0..8],
                &s[8..12],
                &s[12..16],
                &s[16..20],
                &s[20..]
            );
            let expected = match c {
                Characteristic::CurrentState => CURRENT_STATE_UUID,
                Characteristic::ErrorState => ERROR_STATE_UUID,
                Characteristic::RpcCommand => RPC_COMMAND_UUID,
                Characteristic::RpcResult => RPC_RESULT_UUID,
                Characteristic::Capabilities => CAPABILITIES_UUID,
            };
            assert_eq!(dashed, expected);
            assert_eq!(Characteristic::from_u128(c.as_u128()), Some(c));
        }
        assert_eq!(Characteristic::from_u128(Characteristic::service_u128()), None);
    }

    #[test]
    fn state_values_must_be_single_known_byte() {
        assert_eq!(DeviceState::from_value(&[0x04]), Some(DeviceState::Provisioned));
        assert_eq!(DeviceState::from_value(&[0x09]), None);
        assert_eq!(DeviceState::from_value(&[]), None);
        assert_eq!(DeviceState::from_value(&[0x01, 0x02]), None);
    }

    #[test]
    fn error_codes_keep_undefined_bytes() {
        for code in ErrorCode::DEFINED {
            assert_eq!(ErrorCode::from_byte(code.as_byte()), code);
        }
        assert_eq!(ErrorCode::from_byte(0x42), ErrorCode::Other(0x42));
        assert!(!ErrorCode::NoError.is_error());
        assert!(ErrorCode::Other(0x42).is_error());
    }

    #[test]
    fn capability_bits() {
        let both = Capabilities::IDENTIFY | Capabilities::PROVISION;
        assert!(both.contains(Capabilities::IDENTIFY));
        assert!(!Capabilities::PROVISION.contains(Capabilities::IDENTIFY));
        assert!(Capabilities::from_bits(0).is_empty());
        assert_eq!(Capabilities::for_command(commands::IDENTIFY), Some(Capabilities::IDENTIFY));
        assert_eq!(Capabilities::for_command(0x7f), None);
    }
}
