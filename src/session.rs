//! Session: owns the allocator, settings, encoder and decoder.
//!
//! A session is single-threaded; the caller serialises the four entry
//! points. The recovered-data callback fires synchronously from inside
//! `decode_original` / `decode_recovery`, in ascending sequence order,
//! before the call returns.

use std::sync::Arc;

use crate::config::CodecConfig;
use crate::decoder::{Decoder, DecoderStats};
use crate::encoder::{Encoder, Recovery};
use crate::error::CcatError;
use crate::gf256;
use crate::pool::MemoryPool;
use crate::{DECODER_WINDOW, MAX_RECOVERY_ROWS};

/// Callback invoked for every original the decoder reconstructs, with its
/// sequence number and payload. Application context lives in the closure.
pub type RecoveredHandler = Box<dyn FnMut(u64, &[u8]) + Send>;

/// Default pool block size. Payloads beyond this fall through to
/// exact-size allocations.
const POOL_BLOCK_BYTES: usize = 2048;

pub struct Session {
    encoder: Encoder,
    decoder: Decoder,
}

impl Session {
    /// Validates the settings and builds both subcodecs around one shared
    /// pool.
    pub fn create(config: CodecConfig, on_recovered: RecoveredHandler) -> Result<Self, CcatError> {
        config.validate()?;
        gf256::init_gf_tables();
        let capacity = DECODER_WINDOW + config.window_packets + 2 * MAX_RECOVERY_ROWS;
        let pool = Arc::new(MemoryPool::new(capacity, POOL_BLOCK_BYTES)?);
        Ok(Self {
            encoder: Encoder::new(&config, Arc::clone(&pool)),
            decoder: Decoder::new(pool, on_recovered),
        })
    }

    /// Submits one original for transmission; returns its sequence number.
    pub fn encode_original(&mut self, data: &[u8], send_usec: u64) -> Result<u64, CcatError> {
        self.encoder.encode_original(data, send_usec)
    }

    /// Emits a recovery packet covering the retained originals, or `None`
    /// when there is nothing to cover.
    pub fn encode_recovery(&mut self) -> Result<Option<Recovery>, CcatError> {
        self.encoder.encode_recovery()
    }

    /// Hands a received original to the decoder window.
    pub fn decode_original(&mut self, sequence: u64, data: &[u8]) -> Result<(), CcatError> {
        self.decoder.decode_original(sequence, data)
    }

    /// Hands a received recovery packet and its span metadata to the decoder.
    pub fn decode_recovery(
        &mut self,
        sequence_start: u64,
        count: u32,
        row: u8,
        data: &[u8],
    ) -> Result<(), CcatError> {
        self.decoder.decode_recovery(sequence_start, count, row, data)
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_invalid_settings() {
        let config = CodecConfig {
            window_msec: 100,
            window_packets: crate::MAX_ENCODER_WINDOW + 1,
        };
        assert!(Session::create(config, Box::new(|_, _| {})).is_err());
    }

    #[test]
    fn create_accepts_defaults() {
        assert!(Session::create(CodecConfig::default(), Box::new(|_, _| {})).is_ok());
    }
}
