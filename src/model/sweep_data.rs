//! Frequency-sorted index of the blocks of one sweep.

use num_complex::Complex;
use tracing::trace;

use super::data_block::DataBlock;

/// Points of one selection, in ascending frequency order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    /// Measured frequencies in MHz.
    pub freqs: Vec<f64>,
    /// S21 estimates (block means).
    pub s21: Vec<Complex<f64>>,
    /// Per-point standard deviations.
    pub errors: Vec<f64>,
}

impl Trace {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.freqs.len()
    }

    /// True when no point was selected.
    pub fn is_empty(&self) -> bool {
        self.freqs.is_empty()
    }

    /// Frequency of the point with the smallest |S21|, skipping NaN points.
    pub fn min_magnitude_frequency(&self) -> Option<f64> {
        self.freqs
            .iter()
            .zip(&self.s21)
            .filter(|(_, s)| !s.norm().is_nan())
            .min_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(f, _)| *f)
    }
}

/// Blocks of one sweep, kept sorted by measured frequency.
///
/// `freqs`, `sweep_indexes`, `channel_ids` and `blocks` are parallel: position `i` of each
/// describes the same block, and `freqs` is non-decreasing after every insertion. Blocks
/// with equal frequency keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct SweepData {
    sweep_id: u32,
    blocks: Vec<DataBlock>,
    freqs: Vec<f64>,
    sweep_indexes: Vec<Option<usize>>,
    channel_ids: Vec<usize>,
}

impl SweepData {
    /// Create an empty sweep.
    pub fn new(sweep_id: u32) -> Self {
        Self {
            sweep_id,
            ..Default::default()
        }
    }

    /// Identifier of this sweep.
    pub fn sweep_id(&self) -> u32 {
        self.sweep_id
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True when no block has been added.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Insert a block at its frequency position.
    ///
    /// Binary search for the position (after equal frequencies), then insert into all
    /// parallel sequences at that position.
    pub fn add_block(&mut self, block: DataBlock) {
        let freq = block.frequency();
        let position = self.freqs.partition_point(|f| *f <= freq);
        trace!(freq, position, "inserting block");
        self.freqs.insert(position, freq);
        self.sweep_indexes.insert(position, block.meta().sweep_index);
        self.channel_ids.insert(position, block.meta().channel_id);
        self.blocks.insert(position, block);
    }

    /// Blocks in frequency order.
    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    /// Measured frequencies in ascending order.
    pub fn freqs(&self) -> &[f64] {
        &self.freqs
    }

    /// Sweep (offset step) index of each block.
    pub fn sweep_indexes(&self) -> &[Option<usize>] {
        &self.sweep_indexes
    }

    /// Channel id of each block.
    pub fn channel_ids(&self) -> &[usize] {
        &self.channel_ids
    }

    /// S21 estimate of each block.
    pub fn data(&self) -> Vec<Complex<f64>> {
        self.blocks.iter().map(DataBlock::mean).collect()
    }

    /// Standard deviation of each block.
    pub fn errors(&self) -> Vec<f64> {
        self.blocks.iter().map(DataBlock::std).collect()
    }

    fn select_where(&self, keep: impl Fn(usize) -> bool) -> Trace {
        let mut trace = Trace::default();
        for (i, block) in self.blocks.iter().enumerate() {
            if keep(i) {
                trace.freqs.push(self.freqs[i]);
                trace.s21.push(block.mean());
                trace.errors.push(block.std());
            }
        }
        trace
    }

    /// All points measured at offset step `index`, in frequency order.
    pub fn select_by_index(&self, index: usize) -> Trace {
        self.select_where(|i| self.sweep_indexes[i] == Some(index))
    }

    /// All points of one channel across every offset, in frequency order.
    pub fn select_by_channel(&self, channel_id: usize) -> Trace {
        self.select_where(|i| self.channel_ids[i] == channel_id)
    }

    /// Position of the block whose frequency is closest to `freq`.
    ///
    /// Ties go to the lower frequency.
    pub fn nearest_position(&self, freq: f64) -> Option<usize> {
        if self.freqs.is_empty() {
            return None;
        }
        let upper = self.freqs.partition_point(|f| *f < freq);
        if upper == 0 {
            return Some(0);
        }
        if upper == self.freqs.len() {
            return Some(upper - 1);
        }
        let below = freq - self.freqs[upper - 1];
        let above = self.freqs[upper] - freq;
        Some(if above < below { upper } else { upper - 1 })
    }

    /// The block whose frequency is closest to `freq`.
    pub fn nearest_block(&self, freq: f64) -> Option<&DataBlock> {
        self.nearest_position(freq).map(|i| &self.blocks[i])
    }

    /// The full trace of the channel owning the point nearest to `freq`.
    ///
    /// Frequency only locates the channel; every offset of that channel is returned.
    pub fn trace_near_frequency(&self, freq: f64) -> Option<Trace> {
        self.nearest_position(freq)
            .map(|i| self.select_by_channel(self.channel_ids[i]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::data_block::tests::meta;

    fn block(tone: usize, sweep_index: usize, channel_id: usize) -> DataBlock {
        let samples = vec![Complex::new(tone as f64, 0.0); 64];
        DataBlock::with_filter_length(samples, meta(tone, sweep_index, channel_id), 8)
    }

    fn assert_consistent(sweep: &SweepData) {
        assert!(sweep.freqs().windows(2).all(|w| w[0] <= w[1]));
        for (i, block) in sweep.blocks().iter().enumerate() {
            assert_eq!(sweep.freqs()[i], block.frequency());
            assert_eq!(sweep.sweep_indexes()[i], block.meta().sweep_index);
            assert_eq!(sweep.channel_ids()[i], block.meta().channel_id);
        }
    }

    #[test]
    fn insertion_keeps_parallel_arrays_sorted() {
        let mut sweep = SweepData::new(1);
        for (tone, step) in [(500, 0), (100, 1), (300, 2), (100, 3), (900, 4), (200, 5)] {
            sweep.add_block(block(tone, step, tone));
            assert_consistent(&sweep);
        }
        assert_eq!(sweep.len(), 6);
        // equal frequencies keep insertion order
        assert_eq!(&sweep.sweep_indexes()[..2], &[Some(1), Some(3)]);
    }

    #[test]
    fn every_insertion_order_sorts() {
        let tones = [40usize, 10, 30, 20, 50];
        // all rotations and the reversed order
        let mut orders: Vec<Vec<usize>> = (0..tones.len())
            .map(|r| tones.iter().cycle().skip(r).take(tones.len()).copied().collect())
            .collect();
        orders.push(tones.iter().rev().copied().collect());
        for order in orders {
            let mut sweep = SweepData::new(0);
            for tone in order {
                sweep.add_block(block(tone, 0, 0));
            }
            assert_consistent(&sweep);
        }
    }

    #[test]
    fn select_by_index_returns_one_step_in_frequency_order() {
        let mut sweep = SweepData::new(1);
        // two channels (ids 0 and 1) at three offsets
        for step in 0..3 {
            sweep.add_block(block(1000 + step, step, 0));
            sweep.add_block(block(5000 + step, step, 1));
        }
        let trace = sweep.select_by_index(1);
        assert_eq!(trace.len(), 2);
        assert!(trace.freqs[0] < trace.freqs[1]);
        assert!((trace.s21[0] - Complex::new(1001.0, 0.0)).norm() < 1e-6);

        assert!(sweep.select_by_index(7).is_empty());
    }

    #[test]
    fn nearest_point_minimizes_distance() {
        let mut sweep = SweepData::new(1);
        for tone in [100, 200, 400] {
            sweep.add_block(block(tone, 0, tone));
        }
        let f = |tone: usize| 512.0 * tone as f64 / 65536.0;

        assert_eq!(sweep.nearest_block(f(0)).unwrap().meta().tone, 100);
        assert_eq!(sweep.nearest_block(f(260)).unwrap().meta().tone, 200);
        assert_eq!(sweep.nearest_block(f(340)).unwrap().meta().tone, 400);
        assert_eq!(sweep.nearest_block(f(9000)).unwrap().meta().tone, 400);
        assert!(SweepData::new(0).nearest_block(1.0).is_none());
    }

    #[test]
    fn trace_near_frequency_returns_whole_channel() {
        let mut sweep = SweepData::new(1);
        for step in 0..5 {
            sweep.add_block(block(1000 + 10 * step, step, 0));
            sweep.add_block(block(3000 + 10 * step, step, 1));
        }
        let target = 512.0 * 3021.0 / 65536.0;
        let trace = sweep.trace_near_frequency(target).unwrap();

        assert_eq!(trace.len(), 5);
        assert!(trace.s21.iter().all(|s| s.re > 2999.0));
        assert!(trace.freqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn min_magnitude_frequency_skips_nan() {
        let trace = Trace {
            freqs: vec![1.0, 2.0, 3.0],
            s21: vec![
                Complex::new(f64::NAN, 0.0),
                Complex::new(0.5, 0.0),
                Complex::new(0.1, 0.1),
            ],
            errors: vec![0.0; 3],
        };
        assert_eq!(trace.min_magnitude_frequency(), Some(3.0));
    }
}
