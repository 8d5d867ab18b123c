pub mod config;

pub use config::{ConfigManager, CoreConfig};
