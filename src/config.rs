use crate::error::CcatError;
use crate::MAX_ENCODER_WINDOW;
use serde::Deserialize;

/// Immutable per-session settings, parsed from a `[codec]` TOML table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Originals older than this many milliseconds are evicted from the
    /// encoder window.
    pub window_msec: u64,

    /// The encoder retains at most this many originals.
    pub window_packets: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            window_msec: 200,
            window_packets: 128,
        }
    }
}

#[derive(Deserialize)]
struct ConfigRoot {
    codec: Option<CodecConfig>,
}

impl CodecConfig {
    /// Load configuration from a TOML string with a `[codec]` table.
    /// Missing table or fields fall back to defaults.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        let root: ConfigRoot = toml::from_str(s)?;
        Ok(root.codec.unwrap_or_default())
    }

    pub fn validate(&self) -> Result<(), CcatError> {
        if self.window_packets == 0 || self.window_packets > MAX_ENCODER_WINDOW {
            return Err(CcatError::InvalidInput("window_packets out of range"));
        }
        if self.window_msec == 0 {
            return Err(CcatError::InvalidInput("window_msec must be nonzero"));
        }
        Ok(())
    }
}
