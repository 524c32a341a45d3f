//! # Lantuya
//!
//! Asynchronous LAN control and discovery for Tuya-compatible smart
//! devices. Speaks the local binary protocol (v3.1 through v3.5)
//! directly over TCP/UDP, without cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lantuya::{DeviceBuilder, GetOptions};
//!
//! # async fn example() -> lantuya::Result<()> {
//! let device = DeviceBuilder::new()
//!     .id("DEVICE_ID")
//!     .key("DEVICE_KEY_16BYTE")
//!     .version("3.3".parse()?)
//!     .build()?;
//!
//! device.find().await?; // resolve the ip from broadcasts
//! let on = device.get(GetOptions::default()).await?;
//! println!("DP 1 = {on}");
//! # Ok(())
//! # }
//! ```

pub mod cipher;
pub mod device;
pub mod discovery;
pub mod error;
pub mod protocol;
mod session;

pub use cipher::Cipher;
pub use device::{
    Device, DeviceBuilder, DeviceEvent, GetOptions, RefreshOptions, SetOptions,
};
pub use discovery::{DiscoveredDevice, Discovery, FindQuery};
pub use error::{Error, Result};
pub use protocol::{CommandType, Version};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[must_use]
pub fn version() -> &'static str {
    VERSION
}
