//! `herald-core` — configuration shared by the Herald crates.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, DispatcherSettings, HeraldConfig, RetrySettings, SmtpConfig, SmtpTls};
pub use error::{HeraldError, Result};
