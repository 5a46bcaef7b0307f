//! # pmoradiostream
//!
//! HTTP side of the relay: [`RadioStreamProvider`] hands the session manager
//! a playable resource per start, and [`RadioClient`] reads the station's
//! status API for now-playing information.
//!
//! Both degrade instead of failing: an unreachable stream yields a resource
//! that retries the URL when first read, and an unreachable status API
//! yields a fallback document.

pub mod client;
pub mod config;
pub mod error;
pub mod provider;
pub mod status;

use std::sync::Arc;

pub use client::{ClientBuilder, RadioClient};
pub use config::RadioStreamConfig;
pub use error::{Error, Result};
pub use provider::RadioStreamProvider;
pub use status::{clean_title, format_position, RadioStats, RadioStatus};

/// Build the provider described by the `radio` section.
pub fn provider_from_config(config: &pmoconfig::Config) -> Result<Arc<RadioStreamProvider>> {
    let radio = RadioStreamConfig::from_config(config);
    Ok(Arc::new(RadioStreamProvider::from_config(&radio)?))
}
