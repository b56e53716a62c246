//! Improv BLE Controller
//!
//! BLE client for provisioning Wi-Fi credentials onto Improv devices.
//!
//! # Example
//!
//! ```ignore
//! use improv_ble_controller::{ProvisionConfig, SessionRegistry, ble};
//! use improv_proto::Credentials;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProvisionConfig::default();
//!     let registry = SessionRegistry::with_known(&config.known_devices);
//!
//!     // Scan for devices
//!     let adapter = ble::get_adapter().await?;
//!     for device in ble::discover(&adapter, config.scan_duration).await? {
//!         println!("{} ({})", device.name, device.address);
//!     }
//!
//!     // Provision the first device found
//!     let credentials = Credentials::new("MySSID", "MyPassword")?;
//!     let outcome = ble::provision(None, &credentials, &registry, &config, |_| {}).await?;
//!     println!("{outcome}");
//!
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod config;
pub mod device;
pub mod negotiate;
pub mod outcome;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

pub use config::{ConfigError, ProvisionConfig, improv_home};
pub use device::DeviceHandle;
pub use outcome::Outcome;
pub use registry::{ConcurrentSessionError, SessionGuard, SessionRegistry};
pub use session::{
    CancelHandle, FailureReason, MenuOption, Session, SessionError, State, Step,
};
pub use transport::{Notification, NotificationStream, Transport, TransportError};
