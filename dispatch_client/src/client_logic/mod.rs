pub mod config;
pub mod console;
pub mod device;
pub mod logger;
