// Copyright (c) 2024, The CCat Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Decoder: a sliding window with a bit-level loss map, a sorted list of
//! outstanding recovery packets, and a GF(2^8) solver that reconstructs
//! lost originals.
//!
//! The window tracks the contiguous sequence range `[sequence_base,
//! sequence_end)`. A loss bit is set for every offset not yet received;
//! bits past the live range stay set so the window can grow forward for
//! free. The window shifts in whole 64-bit words and rotates the slot ring
//! instead of moving payloads.
//!
//! Recovery packets whose span holds a single loss resolve through the XOR
//! fast path immediately. Everything else waits on the sorted list until a
//! contiguous run of recoveries covers as many rows as losses, at which
//! point a dense Gaussian elimination with partial pivoting runs over the
//! Cauchy coefficients.

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::bitset::LossBitset;
use crate::cauchy;
use crate::error::CcatError;
use crate::gf256;
use crate::pool::{MemoryPool, PoolBlock};
use crate::seq;
use crate::session::RecoveredHandler;
use crate::{DECODER_WINDOW, MATRIX_COLUMNS, MAX_RECOVERY_ROWS};

/// Outcome of fitting a sequence span into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expand {
    InWindow,
    OutOfWindow,
    Evacuated,
    Shifted,
}

/// Outcome of a matrix solve attempt.
enum SolveOutcome {
    Solved,
    NeedsMoreData,
    Failed,
}

/// An outstanding recovery packet whose span references window sequences.
struct RecoveryPacket {
    data: PoolBlock,
    sequence_start: u64,
    sequence_end: u64,
    row: u8,
}

/// Counters mirrored out through `Session::decoder_stats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    /// Most recent sequence number a solve failed to recover.
    pub failure_sequence: u64,
    /// Matrix solves over two or more losses that succeeded.
    pub large_recovery_successes: u64,
    /// Matrix solves that hit a singular system or a bad length prefix.
    pub large_recovery_failures: u64,
}

/// Solver scratch: one matrix row per recovery in the span being solved.
struct RowState {
    row: u8,
    sequence_start: u64,
    sequence_end: u64,
    column_start: usize,
    column_end: usize,
}

/// Solver scratch: one column per lost sequence in the span union.
struct ColumnState {
    sequence: u64,
}

pub struct Decoder {
    pool: Arc<MemoryPool>,
    /// Set bits mark window offsets not yet received.
    lost: LossBitset,
    /// Ring buffer of length-prefixed originals, indexed through `rotation`.
    packets: Vec<Option<PoolBlock>>,
    rotation: usize,
    /// First sequence number in the window.
    sequence_base: u64,
    /// Largest observed sequence number + 1.
    sequence_end: u64,
    /// Outstanding recoveries sorted by `(sequence_start, sequence_end)`.
    recoveries: Vec<RecoveryPacket>,
    on_recovered: RecoveredHandler,
    stats: DecoderStats,
}

impl Decoder {
    pub fn new(pool: Arc<MemoryPool>, on_recovered: RecoveredHandler) -> Self {
        Self {
            pool,
            lost: LossBitset::new(),
            packets: (0..DECODER_WINDOW).map(|_| None).collect(),
            rotation: 0,
            sequence_base: 0,
            sequence_end: 0,
            recoveries: Vec::new(),
            on_recovered,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Ring lookup for a 0-based window offset.
    #[inline]
    fn slot_index(&self, element: usize) -> usize {
        debug_assert!(element < DECODER_WINDOW);
        let mut index = element + self.rotation;
        if index >= DECODER_WINDOW {
            index -= DECODER_WINDOW;
        }
        index
    }

    /// Window offset of a sequence at or above the base.
    #[inline]
    fn element_of(&self, sequence: u64) -> usize {
        let delta = seq::delta(sequence, self.sequence_base);
        debug_assert!(delta >= 0);
        delta as usize
    }

    /// Lost-packet count in the sequence range `[start, end)`.
    fn lost_in_range(&self, start: u64, end: u64) -> usize {
        self.lost
            .range_popcount(self.element_of(start), self.element_of(end))
    }

    /// Accepts one original received from the transport.
    pub fn decode_original(&mut self, sequence: u64, data: &[u8]) -> Result<(), CcatError> {
        if data.is_empty() {
            return Err(CcatError::InvalidInput("empty payload"));
        }
        if data.len() > u16::MAX as usize {
            return Err(CcatError::InvalidInput("payload exceeds 16-bit length prefix"));
        }

        let mut block = MemoryPool::alloc(&self.pool, data.len() + 2)?;
        {
            let buf = block.as_mut_slice();
            buf[..2].copy_from_slice(&(data.len() as u16).to_be_bytes());
            buf[2..].copy_from_slice(data);
        }

        if self.expand_window(sequence, 1) == Expand::OutOfWindow {
            debug!("original {} below window base {}", sequence, self.sequence_base);
            return Ok(());
        }
        let element = self.element_of(sequence);
        if !self.lost.test(element) {
            // Duplicate; the first copy wins.
            return Ok(());
        }
        let index = self.slot_index(element);
        self.packets[index] = Some(block);
        self.lost.clear(element);
        self.run_solver();
        Ok(())
    }

    /// Accepts one recovery packet plus its out-of-band span metadata.
    pub fn decode_recovery(
        &mut self,
        sequence_start: u64,
        count: u32,
        row: u8,
        data: &[u8],
    ) -> Result<(), CcatError> {
        if count == 0 || count as usize > MATRIX_COLUMNS {
            return Err(CcatError::InvalidInput("recovery span count out of range"));
        }
        if row == 0 || row as usize > MAX_RECOVERY_ROWS {
            return Err(CcatError::InvalidInput("recovery row out of range"));
        }
        if data.len() < 3 {
            return Err(CcatError::InvalidInput("recovery shorter than a length prefix"));
        }

        if self.expand_window(sequence_start, count as usize) == Expand::OutOfWindow {
            debug!(
                "recovery [{}, +{}) below window base {}",
                sequence_start, count, self.sequence_base
            );
            return Ok(());
        }
        let sequence_end = sequence_start.wrapping_add(count as u64);
        match self.lost_in_range(sequence_start, sequence_end) {
            // Every covered original already arrived; nothing new here.
            0 => Ok(()),
            1 => {
                if self
                    .solve_lost_one(sequence_start, sequence_end, row, data)
                    .is_some()
                {
                    self.run_solver();
                }
                Ok(())
            }
            _ => {
                self.store_recovery(sequence_start, sequence_end, row, data)?;
                self.run_solver();
                Ok(())
            }
        }
    }

    //--------------------------------------------------------------------------
    // Window maintenance

    /// Expands the window to contain `[sequence_start, sequence_start + count)`.
    fn expand_window(&mut self, sequence_start: u64, count: usize) -> Expand {
        if seq::before(sequence_start, self.sequence_base) {
            return Expand::OutOfWindow;
        }
        let needed_end = sequence_start.wrapping_add(count as u64);
        let span = seq::delta(needed_end, self.sequence_base) as u64;
        if span <= DECODER_WINDOW as u64 {
            if seq::before(self.sequence_end, needed_end) {
                self.sequence_end = needed_end;
            }
            return Expand::InWindow;
        }

        // Shift forward in whole words to keep the bitset maintenance cheap.
        let overflow = span - DECODER_WINDOW as u64;
        let word_shift = overflow.div_ceil(64) * 64;
        if word_shift >= DECODER_WINDOW as u64 {
            // The span is so far ahead that no live slot would survive the
            // shift: restart the window instead.
            debug!("window evacuated, new base {}", sequence_start);
            for slot in &mut self.packets {
                *slot = None;
            }
            self.lost.set_all();
            self.rotation = 0;
            self.sequence_base = sequence_start;
            self.sequence_end = needed_end;
            self.drop_stale_recoveries();
            return Expand::Evacuated;
        }

        let shift = word_shift as usize;
        for element in 0..shift {
            let index = self.slot_index(element);
            self.packets[index] = None;
        }
        self.lost.shift_down(shift);
        self.rotation = (self.rotation + shift) % DECODER_WINDOW;
        self.sequence_base = self.sequence_base.wrapping_add(shift as u64);
        if seq::before(self.sequence_end, self.sequence_base) {
            self.sequence_end = self.sequence_base;
        }
        if seq::before(self.sequence_end, needed_end) {
            self.sequence_end = needed_end;
        }
        trace!("window shifted by {} to base {}", shift, self.sequence_base);
        self.drop_stale_recoveries();
        Expand::Shifted
    }

    /// Drops recoveries whose spans now start below the base; the evicted
    /// originals they reference can no longer be eliminated.
    fn drop_stale_recoveries(&mut self) {
        let base = self.sequence_base;
        let len_before = self.recoveries.len();
        self.recoveries
            .retain(|recovery| !seq::before(recovery.sequence_start, base));
        let dropped = len_before - self.recoveries.len();
        if dropped > 0 {
            trace!("dropped {} stale recoveries", dropped);
        }
    }

    //--------------------------------------------------------------------------
    // Recovery list

    /// Inserts a recovery into the sorted list, dropping exact duplicates
    /// and evicting the oldest entry when the list is full.
    fn store_recovery(
        &mut self,
        sequence_start: u64,
        sequence_end: u64,
        row: u8,
        data: &[u8],
    ) -> Result<(), CcatError> {
        let duplicate = self.recoveries.iter().any(|r| {
            r.sequence_start == sequence_start && r.sequence_end == sequence_end && r.row == row
        });
        if duplicate {
            return Ok(());
        }
        let mut block = MemoryPool::alloc(&self.pool, data.len())?;
        block.as_mut_slice().copy_from_slice(data);
        if self.recoveries.len() == MAX_RECOVERY_ROWS {
            self.recoveries.remove(0);
        }
        let position = self.recoveries.partition_point(|r| {
            seq::before(r.sequence_start, sequence_start)
                || (r.sequence_start == sequence_start
                    && seq::before(r.sequence_end, sequence_end))
        });
        self.recoveries.insert(
            position,
            RecoveryPacket {
                data: block,
                sequence_start,
                sequence_end,
                row,
            },
        );
        Ok(())
    }

    //--------------------------------------------------------------------------
    // Solver

    /// Drains every recovery the fast path can satisfy, then scans for
    /// multi-loss spans, until neither makes progress.
    fn run_solver(&mut self) {
        loop {
            let fast = self.drain_fast_path();
            let slow = self.find_solutions();
            if !fast && !slow {
                break;
            }
        }
    }

    /// Consumes listed recoveries that became useless (no losses left) or
    /// trivially solvable (exactly one loss).
    fn drain_fast_path(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let mut action = None;
            for (index, recovery) in self.recoveries.iter().enumerate() {
                match self.lost_in_range(recovery.sequence_start, recovery.sequence_end) {
                    0 => {
                        action = Some((index, false));
                        break;
                    }
                    1 => {
                        action = Some((index, true));
                        break;
                    }
                    _ => {}
                }
            }
            let Some((index, solvable)) = action else {
                break;
            };
            let recovery = self.recoveries.remove(index);
            if solvable {
                self.solve_lost_one(
                    recovery.sequence_start,
                    recovery.sequence_end,
                    recovery.row,
                    recovery.data.as_slice(),
                );
            }
            progressed = true;
        }
        progressed
    }

    /// Fast path: a recovery span containing exactly one loss. XOR out every
    /// received original, scaled by its coefficient, then unscale the
    /// residual, which is the missing original.
    fn solve_lost_one(
        &mut self,
        sequence_start: u64,
        sequence_end: u64,
        row: u8,
        data: &[u8],
    ) -> Option<u64> {
        let start_element = self.element_of(sequence_start);
        let end_element = self.element_of(sequence_end);
        let lost_element = self
            .lost
            .find_next_set(start_element)
            .filter(|&element| element < end_element)?;
        let lost_sequence = self
            .sequence_base
            .wrapping_add(lost_element as u64);

        let mut residual = match MemoryPool::alloc(&self.pool, data.len()) {
            Ok(block) => block,
            Err(_) => return None,
        };
        residual.as_mut_slice().copy_from_slice(data);

        let mut sequence = sequence_start;
        while sequence != sequence_end {
            if sequence != lost_sequence {
                let element = self.element_of(sequence);
                let index = self.slot_index(element);
                let packet = self.packets[index]
                    .as_ref()
                    .expect("present packet has a clear loss bit");
                let coeff = cauchy::coefficient(row, cauchy::column_for_sequence(sequence));
                gf256::muladd_slice(residual.as_mut_slice(), packet.as_slice(), coeff);
            }
            sequence = sequence.wrapping_add(1);
        }
        if row != 1 {
            let coeff = cauchy::coefficient(row, cauchy::column_for_sequence(lost_sequence));
            gf256::mul_slice(residual.as_mut_slice(), gf256::gf_inv(coeff));
        }

        if self.install_recovered(lost_sequence, residual) {
            Some(lost_sequence)
        } else {
            None
        }
    }

    /// Scans span ends from the newest recovery backwards, growing each span
    /// toward older recoveries until it holds at least as many rows as the
    /// losses its union covers, then attempts a matrix solve. Solved and
    /// failed spans are both consumed; a restart rescans the shortened list.
    fn find_solutions(&mut self) -> bool {
        let mut progressed = false;
        'scan: loop {
            let outstanding = self.recoveries.len();
            if outstanding < 2 {
                return progressed;
            }
            for end_index in (0..outstanding).rev() {
                let mut span_end_seq = self.recoveries[end_index].sequence_end;
                for start_index in (0..=end_index).rev() {
                    let candidate = &self.recoveries[start_index];
                    let span_start_seq = candidate.sequence_start;
                    if seq::before(span_end_seq, candidate.sequence_end) {
                        span_end_seq = candidate.sequence_end;
                    }
                    let rows = end_index - start_index + 1;
                    let lost = self.lost_in_range(span_start_seq, span_end_seq);
                    if lost > MAX_RECOVERY_ROWS {
                        break; // widening only adds losses
                    }
                    if lost < 2 || rows < lost {
                        continue;
                    }
                    match self.solve(start_index, end_index, span_start_seq, span_end_seq, lost) {
                        SolveOutcome::NeedsMoreData => continue,
                        SolveOutcome::Solved => {
                            self.stats.large_recovery_successes += 1;
                            self.recoveries.drain(start_index..=end_index);
                            progressed = true;
                            continue 'scan;
                        }
                        SolveOutcome::Failed => {
                            self.stats.large_recovery_failures += 1;
                            self.recoveries.drain(start_index..=end_index);
                            progressed = true;
                            continue 'scan;
                        }
                    }
                }
            }
            return progressed;
        }
    }

    /// Solves the span `[start_index, end_index]` of the recovery list for
    /// the `column_count` losses its union covers.
    fn solve(
        &mut self,
        start_index: usize,
        end_index: usize,
        span_start: u64,
        span_end: u64,
        column_count: usize,
    ) -> SolveOutcome {
        // Arrays from spans: one column per lost sequence, one row per
        // recovery, with each row's window into the column list.
        let mut columns: Vec<ColumnState> = Vec::with_capacity(column_count);
        let mut element = self.element_of(span_start);
        let end_element = self.element_of(span_end);
        while let Some(found) = self.lost.find_next_set(element) {
            if found >= end_element {
                break;
            }
            columns.push(ColumnState {
                sequence: self.sequence_base.wrapping_add(found as u64),
            });
            element = found + 1;
        }
        debug_assert_eq!(columns.len(), column_count);

        let row_count = end_index - start_index + 1;
        let mut rows: Vec<RowState> = Vec::with_capacity(row_count);
        let mut solution_bytes = 0usize;
        for recovery in &self.recoveries[start_index..=end_index] {
            let column_start = columns
                .partition_point(|c| seq::before(c.sequence, recovery.sequence_start));
            let column_end = columns
                .partition_point(|c| seq::before(c.sequence, recovery.sequence_end));
            solution_bytes = solution_bytes.max(recovery.data.len());
            rows.push(RowState {
                row: recovery.row,
                sequence_start: recovery.sequence_start,
                sequence_end: recovery.sequence_end,
                column_start,
                column_end,
            });
        }

        // Plan the solution: dense row-major coefficient matrix, eliminated
        // to upper-triangular form in place. Elimination multipliers are
        // stashed in the cleared cells so the data pass can replay them.
        let mut matrix = vec![0u8; row_count * column_count];
        for (i, row) in rows.iter().enumerate() {
            for j in row.column_start..row.column_end {
                matrix[i * column_count + j] = cauchy::coefficient(
                    row.row,
                    cauchy::column_for_sequence(columns[j].sequence),
                );
            }
        }

        let mut pivot_rows: Vec<usize> = Vec::with_capacity(column_count);
        let mut used = vec![false; row_count];
        for j in 0..column_count {
            let pivot = match (0..row_count)
                .find(|&r| !used[r] && matrix[r * column_count + j] != 0)
            {
                Some(pivot) => pivot,
                None => {
                    trace!("no pivot for column {}; waiting for more rows", j);
                    return SolveOutcome::NeedsMoreData;
                }
            };
            used[pivot] = true;
            let pivot_inv = gf256::gf_inv(matrix[pivot * column_count + j]);
            for r in 0..row_count {
                if used[r] || matrix[r * column_count + j] == 0 {
                    continue;
                }
                let factor = gf256::gf_mul(matrix[r * column_count + j], pivot_inv);
                for k in j..column_count {
                    let value = gf256::gf_mul(factor, matrix[pivot * column_count + k]);
                    matrix[r * column_count + k] ^= value;
                }
                matrix[r * column_count + j] = factor;
            }
            pivot_rows.push(pivot);
        }

        // Eliminate received originals from copies of the recovery payloads,
        // leaving each row a combination of lost originals only.
        let mut diagonal: Vec<Option<PoolBlock>> = Vec::with_capacity(row_count);
        for (i, row) in rows.iter().enumerate() {
            let source = &self.recoveries[start_index + i];
            let mut block = match MemoryPool::alloc(&self.pool, solution_bytes) {
                Ok(block) => block,
                Err(_) => return SolveOutcome::NeedsMoreData,
            };
            block.as_mut_slice()[..source.data.len()].copy_from_slice(source.data.as_slice());
            let mut sequence = row.sequence_start;
            while sequence != row.sequence_end {
                let element = self.element_of(sequence);
                if !self.lost.test(element) {
                    let index = self.slot_index(element);
                    let packet = self.packets[index]
                        .as_ref()
                        .expect("present packet has a clear loss bit");
                    let coeff =
                        cauchy::coefficient(row.row, cauchy::column_for_sequence(sequence));
                    gf256::muladd_slice(block.as_mut_slice(), packet.as_slice(), coeff);
                }
                sequence = sequence.wrapping_add(1);
            }
            diagonal.push(Some(block));
        }

        // Execute the plan: replay the recorded forward elimination on the
        // data rows, then back-substitute to isolate each column.
        let mut replayed = vec![false; row_count];
        for (j, &pivot) in pivot_rows.iter().enumerate() {
            replayed[pivot] = true;
            for r in 0..row_count {
                if replayed[r] {
                    continue;
                }
                let factor = matrix[r * column_count + j];
                if factor != 0 {
                    let (dst, src) = row_pair(&mut diagonal, r, pivot);
                    gf256::muladd_slice(dst.as_mut_slice(), src.as_slice(), factor);
                }
            }
        }
        for j in (0..column_count).rev() {
            let pivot = pivot_rows[j];
            for k in (j + 1)..column_count {
                let factor = matrix[pivot * column_count + k];
                if factor != 0 {
                    let (dst, src) = row_pair(&mut diagonal, pivot, pivot_rows[k]);
                    gf256::muladd_slice(dst.as_mut_slice(), src.as_slice(), factor);
                }
            }
            let diag_coeff = matrix[pivot * column_count + j];
            if diag_coeff != 1 {
                let block = diagonal[pivot].as_mut().expect("row buffer present");
                gf256::mul_slice(block.as_mut_slice(), gf256::gf_inv(diag_coeff));
            }
        }

        // Validate every length prefix before installing anything, so a bad
        // solve leaves the window untouched.
        for (j, column) in columns.iter().enumerate() {
            let block = diagonal[pivot_rows[j]].as_ref().expect("row buffer present");
            let payload_len = u16::from_be_bytes([block[0], block[1]]) as usize;
            if payload_len + 2 > solution_bytes {
                warn!(
                    "solve of {} losses failed: inconsistent length prefix at {}",
                    column_count, column.sequence
                );
                self.stats.failure_sequence = column.sequence;
                return SolveOutcome::Failed;
            }
        }
        for (j, column) in columns.iter().enumerate() {
            let block = diagonal[pivot_rows[j]].take().expect("row buffer present");
            let installed = self.install_recovered(column.sequence, block);
            debug_assert!(installed);
        }
        debug!(
            "recovered {} originals from a {}-row span",
            column_count, row_count
        );
        SolveOutcome::Solved
    }

    /// Validates the recovered length prefix, installs the buffer into the
    /// window slot in place, and reports it to the application.
    fn install_recovered(&mut self, sequence: u64, mut block: PoolBlock) -> bool {
        let payload_len = u16::from_be_bytes([block[0], block[1]]) as usize;
        if payload_len + 2 > block.len() {
            warn!("recovered {} has an inconsistent length prefix", sequence);
            self.stats.failure_sequence = sequence;
            return false;
        }
        block.truncate(payload_len + 2);
        let element = self.element_of(sequence);
        let index = self.slot_index(element);
        self.packets[index] = Some(block);
        self.lost.clear(element);
        let packet = self.packets[index].as_ref().expect("just installed");
        (self.on_recovered)(sequence, &packet.as_slice()[2..]);
        true
    }
}

/// Disjoint mutable/shared access to two row buffers.
fn row_pair(rows: &mut [Option<PoolBlock>], dst: usize, src: usize) -> (&mut PoolBlock, &PoolBlock) {
    debug_assert_ne!(dst, src);
    if dst < src {
        let (lo, hi) = rows.split_at_mut(src);
        (
            lo[dst].as_mut().expect("row buffer present"),
            hi[0].as_ref().expect("row buffer present"),
        )
    } else {
        let (lo, hi) = rows.split_at_mut(dst);
        (
            hi[0].as_mut().expect("row buffer present"),
            lo[src].as_ref().expect("row buffer present"),
        )
    }
}
