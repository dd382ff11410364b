//! Resolving image prompt labels to pixels
//!
//! A label is either an http(s) URL or a filesystem path. Fetching is a
//! single blocking read with no retries.

use crate::config::FetchConfig;
use crate::error::{PromptError, Result};
use crate::utils::{expand_tilde, is_url};
use image::RgbImage;
use std::time::Duration;

/// Read the raw bytes behind a URL or path.
pub fn fetch(identifier: &str, config: &FetchConfig) -> Result<Vec<u8>> {
    let identifier = identifier.trim();

    if is_url(identifier) {
        tracing::debug!(url = identifier, "fetching image prompt");

        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(config.timeout_secs.map(Duration::from_secs))
            .build()
            .map_err(|e| PromptError::fetch(identifier, e))?;

        let response = client
            .get(identifier)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| PromptError::fetch(identifier, e))?;

        let bytes = response
            .bytes()
            .map_err(|e| PromptError::fetch(identifier, e))?;
        Ok(bytes.to_vec())
    } else {
        let path = expand_tilde(identifier);
        tracing::debug!(path = %path.display(), "reading image prompt");

        std::fs::read(&path).map_err(|e| PromptError::fetch(identifier, e))
    }
}

/// Fetch and decode an image, converting it to 8-bit RGB.
pub fn load_rgb(identifier: &str, config: &FetchConfig) -> Result<RgbImage> {
    let bytes = fetch(identifier, config)?;
    let img = image::load_from_memory(&bytes).map_err(|source| PromptError::Decode {
        identifier: identifier.to_string(),
        source,
    })?;
    Ok(img.to_rgb8())
}
