pub mod config;
pub mod error;
pub mod paths;

pub use config::{Config, UnlockConfig};
pub use error::{UnlockError, Result};
pub use paths::{system_config_file, system_reference_dir, dev_reference_dir};
