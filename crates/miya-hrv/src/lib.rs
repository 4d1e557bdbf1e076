//! MIYA HRV device layer
//!
//! This crate provides a high-level handle for one MIYA ventilation unit
//! on top of the low-level RS-485 protocol crate.

pub mod config;
pub mod device;
pub mod error;

pub use config::DeviceConfig;
pub use device::{DeviceEvent, MiyaDevice};
pub use error::DeviceError;
