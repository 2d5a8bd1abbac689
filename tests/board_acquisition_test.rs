//! Register-level sweeps and reads through `RoachBoard` over the mock FPGA.

use kid_readout::acquisition::ReaderConfig;
use kid_readout::error::ReadoutError;
use kid_readout::hardware::board::{BoardConfig, RoachBoard};
use kid_readout::hardware::mock::MockFpga;
use kid_readout::hardware::ReadoutDevice;
use kid_readout::sweep::{SequencerConfig, SweepSequencer, ToneAllocator};
use std::time::Duration;

fn board_with(fpga: MockFpga, abort_on_gap: bool) -> RoachBoard<MockFpga> {
    RoachBoard::new(
        fpga,
        BoardConfig {
            reader: ReaderConfig {
                buffer_name: "ppout0".to_string(),
                frame_samples: 32,
                bank_bit: 12,
                poll_timeout: Duration::from_millis(20),
                abort_on_gap,
            },
            sample_rate_mhz: 512.0,
            nfft: 256,
            tone_table_size: 1024,
            bin_offset: 0,
        },
    )
}

fn mock() -> MockFpga {
    MockFpga::new("ppout0", 32, 12)
}

fn sequencer(max_retries: usize) -> SweepSequencer {
    SweepSequencer::new(SequencerConfig {
        reads_per_step: 8,
        settle: Duration::ZERO,
        batch_settle: Duration::ZERO,
        max_retries,
        filter_length: 16,
    })
}

fn allocator() -> ToneAllocator {
    ToneAllocator::new(512.0, 1024, 256, 2).unwrap()
}

#[test]
fn test_sweep_loads_each_offset_and_reads_both_channels() {
    let plan = allocator().plan(&[100.0, 200.0], &[0.0, 1.0]).unwrap();
    let mut board = board_with(mock(), false);

    let outcome = sequencer(0).run(&mut board, &plan, 3).unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.sweep.len(), 4);
    assert_eq!(outcome.sweep.sweep_id(), 3);
    let link = board.link();
    // one waveform upload per offset
    assert_eq!(link.writes_to("dacctrl"), vec![0, 1, 0, 1]);
    assert_eq!(link.bram("iout").map(<[u8]>::len), Some(2048));
    // both channels share one read
    assert_eq!(link.register("nchans"), Some(2));
    assert_eq!(board.ntones(), Some(2));

    let record = board.hardware_record(42.0);
    assert_eq!(record.epoch, 42.0);
    assert_eq!(record.ntones, Some(2));
}

#[test]
fn test_dropped_frame_aborts_read_with_partial_frames() {
    let mut board = board_with(mock().lose_swaps_at(4), true);

    let err = board.read_frames(5).unwrap_err();

    assert_eq!(err.requested, 5);
    assert_eq!(err.frames.len(), 2);
    assert!(matches!(
        err.source,
        ReadoutError::FrameGap {
            expected: 4,
            observed: 6
        }
    ));
    assert!(err.is_recoverable());
}

#[test]
fn test_dropped_frame_is_retried_by_the_sequencer() {
    let plan = allocator().plan(&[100.0, 200.0], &[0.0]).unwrap();
    let mut board = board_with(mock().lose_swaps_at(4), true);

    let outcome = sequencer(1).run(&mut board, &plan, 0).unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.sweep.len(), 2);
}

#[test]
fn test_reported_gap_is_retried_by_the_sequencer() {
    let plan = allocator().plan(&[100.0, 200.0], &[0.0]).unwrap();
    let mut board = board_with(mock().lose_swaps_at(4), false);

    let outcome = sequencer(1).run(&mut board, &plan, 0).unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.sweep.len(), 2);
}

#[test]
fn test_reported_gap_skips_the_batch_without_retries() {
    let plan = allocator().plan(&[100.0, 200.0], &[0.0]).unwrap();
    let mut board = board_with(mock().lose_swaps_at(4), false);

    let outcome = sequencer(0).run(&mut board, &plan, 0).unwrap();

    assert!(outcome.sweep.is_empty());
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(
        outcome.failures[0].error,
        ReadoutError::FrameGap {
            expected: 4,
            observed: 6
        }
    ));
}

#[test]
fn test_stalled_link_times_out_and_step_is_skipped() {
    let plan = allocator().plan(&[100.0, 200.0], &[0.0]).unwrap();
    let mut board = board_with(mock().stall_after_swaps(2), false);

    let outcome = sequencer(1).run(&mut board, &plan, 0).unwrap();

    assert!(outcome.sweep.is_empty());
    assert_eq!(outcome.failures.len(), 1);
    let failure = &outcome.failures[0];
    assert_eq!(failure.sweep_index, Some(0));
    assert_eq!(failure.batch, Some(0));
    assert_eq!(failure.attempts, 2);
    assert!(failure.error.is_timeout());
}

#[test]
fn test_gaps_are_reported_when_not_aborting() {
    let mut board = board_with(mock().lose_swaps_at(4), false);

    let capture = board.read_frames(5).unwrap();

    assert_eq!(capture.frames.len(), 5);
    assert!(!capture.is_contiguous());
    assert_eq!(capture.gaps.len(), 1);
    assert_eq!(capture.gaps[0].frame, 2);
    assert_eq!(capture.gaps[0].missed, 2);
}
