pub mod backend;
pub mod device_tracking;
pub mod parse;
pub mod runner;
pub mod track_devices;
