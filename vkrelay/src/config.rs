//! Operator configuration, read from the environment when the layer loads.
//!
//! Nothing here is visible to the application; it only tunes how the layer
//! pairs adapters and how long it is willing to wait on the GPU.

use log::warn;
use std::str::FromStr;
use std::time::Duration;

use crate::topology::PairingPolicy;

/// Slot count never drops below this; the transfer pipeline needs the overlap.
pub const MIN_SLOT_COUNT: u32 = 3;

pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Bound on every fence wait; exceeding it is reported as a hung device.
    pub fence_timeout: Duration,
    pub min_image_count: u32,
    pub pairing: PairingPolicy,
    /// Skip destroying the display-side presentation object on swapchain destruction.
    pub keep_backend_swapchain: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            min_image_count: MIN_SLOT_COUNT,
            pairing: PairingPolicy::FirstMatch,
            keep_backend_swapchain: false,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, "VKRELAY_FENCE_TIMEOUT_MS") {
            config.fence_timeout = Duration::from_millis(ms);
        }
        if let Some(count) = parse::<u32>(&lookup, "VKRELAY_MIN_IMAGE_COUNT") {
            config.min_image_count = count.max(MIN_SLOT_COUNT);
        }

        let render = parse::<usize>(&lookup, "VKRELAY_RENDER_ADAPTER");
        let display = parse::<usize>(&lookup, "VKRELAY_DISPLAY_ADAPTER");
        match (render, display) {
            (Some(render), Some(display)) => {
                config.pairing = PairingPolicy::Indexed { render, display };
            }
            (None, None) => {}
            _ => warn!(
                "VKRELAY_RENDER_ADAPTER and VKRELAY_DISPLAY_ADAPTER must be set together; \
                 using first-match pairing"
            ),
        }

        if let Some(keep) = lookup("VKRELAY_KEEP_BACKEND_SWAPCHAIN") {
            config.keep_backend_swapchain = matches!(keep.trim(), "1" | "true" | "yes");
        }

        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, value);
            None
        }
    }
}
