pub mod adb;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod models;
pub mod scheduler;
