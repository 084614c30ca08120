//! 平台绑定
//!
//! - central: btleplug
//! - peripheral: bluer (BlueZ D-Bus)
//! - 适配器电源状态: bluer

mod adapter;
mod central;
mod peripheral;

pub use adapter::{AdapterSinks, watch_adapter};
pub use central::BtleplugCentral;
pub use peripheral::BluerPeripheral;
