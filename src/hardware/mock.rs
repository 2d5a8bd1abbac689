//! Mock FPGA link
//!
//! Simulates the board's register file and one double buffer without any hardware or real
//! time. Swaps are driven by status polls: every `polls_per_swap` reads of `<buffer>_addr`
//! advance the swap counter by one, so tests are deterministic.
//!
//! # Fault injection
//!
//! - `fail_read_at(n)` - the n-th bank read (0-based) returns a hardware error
//! - `stall_after_swaps(n)` - the swap counter stops at n, polls then time out
//! - `lose_swaps_at(n)` - when the counter would reach n it jumps two further swaps, as if
//!   the reader had been too slow to see them
//!
//! Each bank read returns `frame_samples` samples; sample j is `(swap_count, j)` so tests can
//! tell which swap released the bank.

use num_complex::Complex;
use std::collections::HashMap;

use super::FpgaLink;
use crate::acquisition::Frame;
use crate::error::{ReadoutError, Result};

/// Simulated register file and double buffer.
#[derive(Debug, Clone)]
pub struct MockFpga {
    buffer_name: String,
    frame_samples: usize,
    bank_bit: u32,
    polls_per_swap: u32,
    polls: u32,
    swap_count: u32,
    bank_reads: usize,
    fail_read_at: Option<usize>,
    stall_after: Option<u32>,
    lose_at: Option<u32>,
    registers: HashMap<String, u32>,
    writes: Vec<(String, u32)>,
    brams: HashMap<String, Vec<u8>>,
}

impl MockFpga {
    /// Create a mock with one double buffer named `buffer_name`.
    pub fn new(buffer_name: &str, frame_samples: usize, bank_bit: u32) -> Self {
        Self {
            buffer_name: buffer_name.to_string(),
            frame_samples,
            bank_bit,
            polls_per_swap: 1,
            polls: 0,
            swap_count: 0,
            bank_reads: 0,
            fail_read_at: None,
            stall_after: None,
            lose_at: None,
            registers: HashMap::new(),
            writes: Vec::new(),
            brams: HashMap::new(),
        }
    }

    /// Number of status polls between swaps.
    pub fn with_polls_per_swap(mut self, polls: u32) -> Self {
        self.polls_per_swap = polls.max(1);
        self
    }

    /// Fail the n-th bank read (0-based).
    pub fn fail_read_at(mut self, read: usize) -> Self {
        self.fail_read_at = Some(read);
        self
    }

    /// Stop swapping once the swap counter reaches `swaps`.
    pub fn stall_after_swaps(mut self, swaps: u32) -> Self {
        self.stall_after = Some(swaps);
        self
    }

    /// Skip two swaps when the counter would reach `swap`.
    pub fn lose_swaps_at(mut self, swap: u32) -> Self {
        self.lose_at = Some(swap);
        self
    }

    /// Current swap counter.
    pub fn swap_count(&self) -> u32 {
        self.swap_count
    }

    /// Bank reads served so far.
    pub fn bank_reads(&self) -> usize {
        self.bank_reads
    }

    /// Every register write, in order.
    pub fn writes(&self) -> &[(String, u32)] {
        &self.writes
    }

    /// Register writes to one register, in order.
    pub fn writes_to(&self, register: &str) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|(name, _)| name == register)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Last value written to a register.
    pub fn register(&self, register: &str) -> Option<u32> {
        self.registers.get(register).copied()
    }

    /// Contents of a block RAM written with `blind_write`.
    pub fn bram(&self, bram: &str) -> Option<&[u8]> {
        self.brams.get(bram).map(Vec::as_slice)
    }

    fn is_status(&self, register: &str) -> bool {
        register
            .strip_suffix("_addr")
            .is_some_and(|name| name == self.buffer_name)
    }

    fn is_bank(&self, bram: &str) -> bool {
        bram.strip_prefix(self.buffer_name.as_str())
            .is_some_and(|suffix| suffix == "_a" || suffix == "_b")
    }

    fn poll(&mut self) -> u32 {
        self.polls += 1;
        let stalled = self
            .stall_after
            .is_some_and(|limit| self.swap_count >= limit);
        if self.polls >= self.polls_per_swap && !stalled {
            self.polls = 0;
            let next = self.swap_count.wrapping_add(1);
            self.swap_count = if self.lose_at == Some(next) {
                next.wrapping_add(2)
            } else {
                next
            };
        }
        self.swap_count.wrapping_shl(self.bank_bit)
    }

    fn bank_frame(&self) -> Vec<u8> {
        let samples: Vec<Complex<f64>> = (0..self.frame_samples)
            .map(|j| Complex::new(f64::from(self.swap_count as i16), (j % 32768) as f64))
            .collect();
        Frame::encode(&samples)
    }
}

impl FpgaLink for MockFpga {
    fn read_uint(&mut self, register: &str) -> Result<u32> {
        if self.is_status(register) {
            return Ok(self.poll());
        }
        Ok(self.registers.get(register).copied().unwrap_or(0))
    }

    fn write_int(&mut self, register: &str, value: u32) -> Result<()> {
        self.registers.insert(register.to_string(), value);
        self.writes.push((register.to_string(), value));
        Ok(())
    }

    fn read(&mut self, bram: &str, nbytes: usize) -> Result<Vec<u8>> {
        if self.is_bank(bram) {
            let read = self.bank_reads;
            self.bank_reads += 1;
            if self.fail_read_at == Some(read) {
                return Err(ReadoutError::hardware(format!(
                    "read of '{bram}' failed (injected at read {read})"
                )));
            }
            let mut bytes = self.bank_frame();
            bytes.resize(nbytes, 0);
            return Ok(bytes);
        }
        let mut bytes = self.brams.get(bram).cloned().unwrap_or_default();
        bytes.resize(nbytes, 0);
        Ok(bytes)
    }

    fn blind_write(&mut self, bram: &str, data: &[u8]) -> Result<()> {
        self.brams.insert(bram.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_polls_drive_swaps() {
        let mut fpga = MockFpga::new("ppout0", 8, 12).with_polls_per_swap(2);
        assert_eq!(fpga.read_uint("ppout0_addr").unwrap(), 0);
        assert_eq!(fpga.read_uint("ppout0_addr").unwrap(), 1 << 12);
        assert_eq!(fpga.swap_count(), 1);
    }

    #[test]
    fn registers_record_writes() {
        let mut fpga = MockFpga::new("ppout0", 8, 12);
        fpga.write_int("fftshift", 7).unwrap();
        fpga.write_int("fftshift", 3).unwrap();
        assert_eq!(fpga.register("fftshift"), Some(3));
        assert_eq!(fpga.writes_to("fftshift"), vec![7, 3]);
        assert_eq!(fpga.read_uint("fftshift").unwrap(), 3);
    }

    #[test]
    fn bank_reads_fail_on_request() {
        let mut fpga = MockFpga::new("ppout0", 8, 12).fail_read_at(1);
        assert!(fpga.read("ppout0_a", 32).is_ok());
        assert!(fpga.read("ppout0_b", 32).is_err());
        assert_eq!(fpga.bank_reads(), 2);
    }

    #[test]
    fn lost_swaps_keep_bank_parity_flipping() {
        let mut fpga = MockFpga::new("ppout0", 8, 12).lose_swaps_at(2);
        fpga.read_uint("ppout0_addr").unwrap();
        let address = fpga.read_uint("ppout0_addr").unwrap();
        assert_eq!(address >> 12, 4);
    }
}
