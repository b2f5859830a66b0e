//! Process-wide configuration: schema + atomically-persisted store (§3, §4.8).

mod schema;
mod store;

pub use schema::{AppConfig, PrinterConfig, SecretString, VideoSource};
pub use store::{ConfigChange, ConfigStore};
