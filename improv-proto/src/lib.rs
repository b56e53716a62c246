//! Improv wire protocol - RPC framing and credential payloads
//!
//! Every RPC command written to the device, and every RPC result it notifies
//! back, is a frame:
//!
//! ```text
//! [command:1][length:1][payload:length][checksum:1]
//! ```
//!
//! The checksum is the XOR of all preceding bytes.

pub mod ble;

pub use ble::{Capabilities, Characteristic, DeviceState, ErrorCode, commands};

/// Largest payload the single length byte can describe
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Longest SSID accepted by 802.11
pub const MAX_SSID_LEN: usize = 32;

/// Longest WPA passphrase
pub const MAX_PASSWORD_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("payload of {0} bytes does not fit the length field")]
    PayloadTooLarge(usize),
    #[error("{0} unexpected bytes after payload")]
    TrailingBytes(usize),
    #[error("malformed string list in payload")]
    MalformedStrings,
}

/// A decoded RPC frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    pub fn identify() -> Self {
        Self::new(commands::IDENTIFY, Vec::new())
    }

    pub fn provision(credentials: &Credentials) -> Self {
        Self::new(commands::PROVISION, credentials.to_bytes())
    }

    /// Build a frame whose payload is a list of length-prefixed strings,
    /// the layout devices use for RPC results
    pub fn from_strings(command: u8, strings: &[&str]) -> Result<Self, FrameError> {
        let mut payload = Vec::new();
        for s in strings {
            let len = u8::try_from(s.len()).map_err(|_| FrameError::PayloadTooLarge(s.len()))?;
            payload.push(len);
            payload.extend_from_slice(s.as_bytes());
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { command, payload })
    }

    /// Read the payload as a list of length-prefixed UTF-8 strings
    pub fn strings(&self) -> Result<Vec<String>, FrameError> {
        let mut out = Vec::new();
        let mut rest = self.payload.as_slice();
        while let [len, tail @ ..] = rest {
            let len = *len as usize;
            if tail.len() < len {
                return Err(FrameError::MalformedStrings);
            }
            let s = std::str::from_utf8(&tail[..len]).map_err(|_| FrameError::MalformedStrings)?;
            out.push(s.to_string());
            rest = &tail[len..];
        }
        Ok(out)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.command, &self.payload)
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

fn is_known_command(command: u8) -> bool {
    matches!(command, commands::IDENTIFY | commands::PROVISION)
}

/// Encode a command and its payload into wire bytes
pub fn encode(command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u8::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(3 + payload.len());
    buf.push(command);
    buf.push(len);
    buf.extend_from_slice(payload);
    buf.push(checksum(&buf));
    Ok(buf)
}

/// Decode wire bytes into a frame
///
/// The checksum is verified before the length field is trusted, so any single
/// corrupted byte is reported as `ChecksumMismatch`.
pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
    let Some((&actual, body)) = data.split_last() else {
        return Err(FrameError::Truncated { expected: 3, actual: 0 });
    };
    if data.len() < 3 {
        return Err(FrameError::Truncated { expected: 3, actual: data.len() });
    }

    let expected = checksum(body);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    let command = body[0];
    let len = body[1] as usize;
    let payload = &body[2..];
    if payload.len() < len {
        return Err(FrameError::Truncated {
            expected: 3 + len,
            actual: data.len(),
        });
    }
    if payload.len() > len {
        return Err(FrameError::TrailingBytes(payload.len() - len));
    }

    if !is_known_command(command) {
        return Err(FrameError::UnknownCommand(command));
    }

    Ok(Frame {
        command,
        payload: payload.to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    #[error("SSID must not be empty")]
    EmptySsid,
    #[error("SSID is {0} bytes, at most {MAX_SSID_LEN} allowed")]
    SsidTooLong(usize),
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("password is {0} bytes, at most {MAX_PASSWORD_LEN} allowed")]
    PasswordTooLong(usize),
}

/// Wi-Fi credentials, validated on construction
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: String,
    password: String,
}

impl Credentials {
    pub fn new(ssid: &str, password: &str) -> Result<Self, CredentialsError> {
        match ssid.len() {
            0 => return Err(CredentialsError::EmptySsid),
            n if n > MAX_SSID_LEN => return Err(CredentialsError::SsidTooLong(n)),
            _ => {}
        }
        match password.len() {
            0 => return Err(CredentialsError::EmptyPassword),
            n if n > MAX_PASSWORD_LEN => return Err(CredentialsError::PasswordTooLong(n)),
            _ => {}
        }
        Ok(Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// `[ssid_len][ssid][pass_len][pass]`, always within `MAX_PAYLOAD`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.ssid.len() + self.password.len());
        buf.push(self.ssid.len() as u8);
        buf.extend_from_slice(self.ssid.as_bytes());
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(self.password.as_bytes());
        buf
    }
}

// keep the password out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let payloads: [Vec<u8>; 4] = [vec![], vec![0x00], vec![0xAB; 100], vec![0x5A; MAX_PAYLOAD]];
        for command in [commands::IDENTIFY, commands::PROVISION] {
            for payload in &payloads {
                let bytes = encode(command, payload).unwrap();
                assert_eq!(bytes.len(), payload.len() + 3);
                let frame = decode(&bytes).unwrap();
                assert_eq!(frame, Frame::new(command, payload.clone()));
            }
        }
    }

    #[test]
    fn identify_wire_bytes() {
        assert_eq!(Frame::identify().to_bytes().unwrap(), vec![0x02, 0x00, 0x02]);
    }

    #[test]
    fn any_single_corrupted_byte_is_checksum_mismatch() {
        let creds = Credentials::new("HomeNet", "hunter22").unwrap();
        let bytes = Frame::provision(&creds).to_bytes().unwrap();
        for i in 0..bytes.len() {
            for flip in [0x01u8, 0x80, 0xFF] {
                let mut corrupted = bytes.clone();
                corrupted[i] ^= flip;
                assert!(
                    matches!(decode(&corrupted), Err(FrameError::ChecksumMismatch { .. })),
                    "byte {i} flipped with {flip:#x}"
                );
            }
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert_eq!(
            encode(commands::PROVISION, &[0; 256]),
            Err(FrameError::PayloadTooLarge(256))
        );
    }

    #[test]
    fn short_frames_are_truncated() {
        assert!(matches!(decode(&[]), Err(FrameError::Truncated { .. })));
        assert!(matches!(decode(&[0x02, 0x02]), Err(FrameError::Truncated { .. })));

        // declared length 4, only 1 payload byte, checksum still valid
        let body = [commands::PROVISION, 4, 0x10];
        let mut data = body.to_vec();
        data.push(checksum(&body));
        assert_eq!(
            decode(&data),
            Err(FrameError::Truncated { expected: 7, actual: 4 })
        );
    }

    #[test]
    fn extra_bytes_after_payload() {
        let body = [commands::IDENTIFY, 0, 0x10, 0x20];
        let mut data = body.to_vec();
        data.push(checksum(&body));
        assert_eq!(decode(&data), Err(FrameError::TrailingBytes(2)));
    }

    #[test]
    fn unknown_command() {
        let bytes = encode(0x7F, b"x").unwrap();
        assert_eq!(decode(&bytes), Err(FrameError::UnknownCommand(0x7F)));
    }

    #[test]
    fn credentials_validation() {
        assert_eq!(Credentials::new("", "pw"), Err(CredentialsError::EmptySsid));
        assert_eq!(Credentials::new("net", ""), Err(CredentialsError::EmptyPassword));
        assert_eq!(
            Credentials::new(&"s".repeat(33), "pw"),
            Err(CredentialsError::SsidTooLong(33))
        );
        assert_eq!(
            Credentials::new("net", &"p".repeat(65)),
            Err(CredentialsError::PasswordTooLong(65))
        );
        assert!(Credentials::new(&"s".repeat(32), &"p".repeat(64)).is_ok());
    }

    #[test]
    fn credentials_payload_layout() {
        let creds = Credentials::new("HomeNet", "hunter22").unwrap();
        let mut expected = vec![7];
        expected.extend_from_slice(b"HomeNet");
        expected.push(8);
        expected.extend_from_slice(b"hunter22");
        assert_eq!(creds.to_bytes(), expected);
        assert!(!format!("{creds:?}").contains("hunter22"));
    }

    #[test]
    fn result_strings() {
        let frame = Frame::from_strings(commands::PROVISION, &["http://10.0.0.7/setup"]).unwrap();
        let decoded = decode(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.strings().unwrap(), vec!["http://10.0.0.7/setup".to_string()]);

        assert_eq!(Frame::identify().strings().unwrap(), Vec::<String>::new());
        let bad = Frame::new(commands::PROVISION, vec![5, b'a']);
        assert_eq!(bad.strings(), Err(FrameError::MalformedStrings));
    }
}
