//! Encoder: a sliding window of recent originals plus recovery generation.
//!
//! Each accepted original is copied into the window with a 2-byte big-endian
//! length prefix and assigned the next sequence number. A recovery packet is
//! a coefficient-weighted XOR of every retained original; the weights come
//! from the cycling row counter and each original's column index.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;

use crate::cauchy;
use crate::config::CodecConfig;
use crate::error::CcatError;
use crate::gf256;
use crate::pool::{MemoryPool, PoolBlock};
use crate::{MATRIX_COLUMNS, MAX_RECOVERY_ROWS};

/// One retained original: send time, column coefficient index, and the
/// length-prefixed payload copy.
struct WindowElement {
    send_usec: u64,
    column: u8,
    data: PoolBlock,
}

/// A generated recovery packet. `sequence_start`, `count` and `row` are the
/// out-of-band metadata the transport must carry alongside the payload.
pub struct Recovery {
    pub sequence_start: u64,
    pub count: u32,
    pub row: u8,
    data: PoolBlock,
}

impl Recovery {
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }
}

pub struct Encoder {
    pool: Arc<MemoryPool>,
    window_usec: u64,
    window_packets: usize,
    window: VecDeque<WindowElement>,
    next_sequence: u64,
    next_column: u8,
    next_row: u8,
}

impl Encoder {
    pub fn new(config: &CodecConfig, pool: Arc<MemoryPool>) -> Self {
        Self {
            pool,
            window_usec: config.window_msec * 1_000,
            window_packets: config.window_packets,
            window: VecDeque::with_capacity(config.window_packets),
            next_sequence: 0,
            next_column: 0,
            next_row: 1,
        }
    }

    /// Copies one original into the window and assigns its sequence number.
    pub fn encode_original(&mut self, data: &[u8], send_usec: u64) -> Result<u64, CcatError> {
        if data.is_empty() {
            return Err(CcatError::InvalidInput("empty payload"));
        }
        if data.len() > u16::MAX as usize {
            return Err(CcatError::InvalidInput("payload exceeds 16-bit length prefix"));
        }

        let mut block = MemoryPool::alloc(&self.pool, data.len() + 2)?;
        let buf = block.as_mut_slice();
        buf[..2].copy_from_slice(&(data.len() as u16).to_be_bytes());
        buf[2..].copy_from_slice(data);

        self.evict_expired(send_usec);

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let column = self.next_column;
        self.next_column = if self.next_column as usize + 1 == MATRIX_COLUMNS {
            0
        } else {
            self.next_column + 1
        };

        self.window.push_back(WindowElement {
            send_usec,
            column,
            data: block,
        });
        Ok(sequence)
    }

    /// Emits one recovery packet covering every retained original, or `None`
    /// when there is nothing to cover.
    pub fn encode_recovery(&mut self) -> Result<Option<Recovery>, CcatError> {
        let count = self.window.len();
        if count == 0 {
            return Ok(None);
        }

        let solution_bytes = self
            .window
            .iter()
            .map(|element| element.data.len())
            .max()
            .expect("window not empty");
        let mut block = MemoryPool::alloc(&self.pool, solution_bytes)?;

        let row = self.next_row;
        self.next_row = 1 + (self.next_row % MAX_RECOVERY_ROWS as u8);

        for element in &self.window {
            let coeff = cauchy::coefficient(row, element.column);
            gf256::muladd_slice(block.as_mut_slice(), element.data.as_slice(), coeff);
        }

        let sequence_start = self.next_sequence.wrapping_sub(count as u64);
        trace!(
            "recovery row {} over [{}, {})",
            row,
            sequence_start,
            self.next_sequence
        );
        Ok(Some(Recovery {
            sequence_start,
            count: count as u32,
            row,
            data: block,
        }))
    }

    /// Drops originals from the window front that aged out or overflow the
    /// packet budget.
    fn evict_expired(&mut self, now_usec: u64) {
        while let Some(front) = self.window.front() {
            let expired = now_usec.saturating_sub(front.send_usec) > self.window_usec;
            if expired || self.window.len() >= self.window_packets {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(window_msec: u64, window_packets: usize) -> Encoder {
        gf256::init_gf_tables();
        let pool = Arc::new(MemoryPool::new(16, 256).unwrap());
        let config = CodecConfig {
            window_msec,
            window_packets,
        };
        Encoder::new(&config, pool)
    }

    #[test]
    fn sequences_increase_monotonically() {
        let mut enc = encoder(200, 8);
        for expected in 0..20u64 {
            assert_eq!(enc.encode_original(b"x", expected * 10).unwrap(), expected);
        }
    }

    #[test]
    fn rejects_empty_and_oversize_payloads() {
        let mut enc = encoder(200, 8);
        assert_eq!(
            enc.encode_original(&[], 0),
            Err(CcatError::InvalidInput("empty payload"))
        );
        let oversize = vec![0u8; 65536];
        assert!(enc.encode_original(&oversize, 0).is_err());
    }

    #[test]
    fn window_is_bounded_by_packet_count() {
        let mut enc = encoder(1_000, 4);
        for i in 0..10u64 {
            enc.encode_original(&[i as u8], 0).unwrap();
        }
        let recovery = enc.encode_recovery().unwrap().unwrap();
        assert_eq!(recovery.count, 4);
        assert_eq!(recovery.sequence_start, 6);
    }

    #[test]
    fn window_evicts_by_age() {
        let mut enc = encoder(1, 8); // 1 ms = 1000 us
        enc.encode_original(b"old", 0).unwrap();
        enc.encode_original(b"new", 5_000).unwrap();
        let recovery = enc.encode_recovery().unwrap().unwrap();
        assert_eq!(recovery.count, 1);
        assert_eq!(recovery.sequence_start, 1);
    }

    #[test]
    fn skip_when_window_is_empty() {
        let mut enc = encoder(200, 8);
        assert!(enc.encode_recovery().unwrap().is_none());
    }

    #[test]
    fn row_counter_cycles_through_parity() {
        let mut enc = encoder(200, 8);
        enc.encode_original(b"x", 0).unwrap();
        for expected in 1..=MAX_RECOVERY_ROWS as u8 {
            let recovery = enc.encode_recovery().unwrap().unwrap();
            assert_eq!(recovery.row, expected);
        }
        assert_eq!(enc.encode_recovery().unwrap().unwrap().row, 1);
    }

    #[test]
    fn parity_recovery_is_xor_of_window() {
        let mut enc = encoder(200, 8);
        enc.encode_original(&[0xAA, 0xBB], 0).unwrap();
        enc.encode_original(&[0x11], 0).unwrap();
        let recovery = enc.encode_recovery().unwrap().unwrap();
        assert_eq!(recovery.row, 1);
        // Length-prefixed buffers: [0,2,AA,BB] ^ [0,1,11,0 pad]
        assert_eq!(recovery.data(), &[0x00, 0x03, 0xBB, 0xBB]);
    }
}
