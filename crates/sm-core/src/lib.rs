pub mod config;
pub mod logging;
pub mod platform;
pub mod song;
