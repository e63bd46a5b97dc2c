pub mod aliases;
pub mod cache;
pub mod manager;
pub mod worker;

pub use manager::{AsyncDeviceManager, DiscoveryEvent, DiscoveryRequest, EventEmitter};
