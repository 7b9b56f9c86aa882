//! The concrete Bluetooth LE transport: advertisement constants
//! (§6.2) plus the `btleplug`-backed driver satisfying the
//! [`crate::transport::Transport`] contract (§6.3).

#[cfg(feature = "ble")]
pub mod mesh_service;
pub mod protocol;

#[cfg(feature = "ble")]
pub use mesh_service::BleTransport;