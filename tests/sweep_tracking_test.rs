//! End-to-end resonance tracking against the simulated readout, through the store.

use kid_readout::analysis::{EstimateSource, ParabolicMinimum, ResonanceConsolidator};
use kid_readout::hardware::simulated::{Resonator, SimulatedReadout};
use kid_readout::hardware::ReadoutDevice;
use kid_readout::store::{ReadoutFile, ReadoutFileWriter};
use kid_readout::sweep::{linear_offsets, SequencerConfig, SweepSequencer, ToneAllocator};
use std::time::Duration;

const TRUE_RESONANCES: [f64; 5] = [100.0, 140.0, 180.0, 220.0, 260.0];

fn device() -> SimulatedReadout {
    SimulatedReadout::new(512.0, 1 << 14, 1 << 16, 256)
        .with_resonators(TRUE_RESONANCES.iter().map(|f| Resonator::new(*f, 5_000.0, 0.8)))
}

fn sequencer() -> SweepSequencer {
    SweepSequencer::new(SequencerConfig {
        reads_per_step: 4,
        settle: Duration::ZERO,
        batch_settle: Duration::ZERO,
        max_retries: 1,
        filter_length: 16,
    })
}

fn allocator() -> ToneAllocator {
    ToneAllocator::new(512.0, 1 << 16, 1 << 14, 4).unwrap()
}

#[test]
fn test_refine_moves_estimates_to_resonances() {
    let guesses: Vec<f64> = TRUE_RESONANCES.iter().map(|f| f + 0.05).collect();
    let offsets = linear_offsets(-0.1, 0.1, 21);
    let plan = allocator().plan(&guesses, &offsets).unwrap();
    let mut device = device();

    let outcome = sequencer().run(&mut device, &plan, 0).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.sweep.len(), TRUE_RESONANCES.len() * offsets.len());

    let estimates =
        ResonanceConsolidator::default().refine(&outcome.sweep, &guesses, &ParabolicMinimum);
    assert_eq!(estimates.len(), TRUE_RESONANCES.len());
    for (estimate, truth) in estimates.iter().zip(TRUE_RESONANCES) {
        assert_ne!(estimate.source, EstimateSource::PriorGuess);
        assert!(
            (estimate.chosen - truth).abs() < 0.02,
            "channel {} chose {} for a resonance at {truth}",
            estimate.channel_id,
            estimate.chosen
        );
        let nearest = estimate.nearest_measured.unwrap();
        assert!((nearest - estimate.chosen).abs() < 0.01);
    }
}

#[test]
fn test_refine_keeps_unsorted_guesses_on_their_own_resonators() {
    let guesses = [260.0, 100.0, 180.0];
    let mut device = SimulatedReadout::new(512.0, 1 << 14, 1 << 16, 256)
        .with_resonators(guesses.iter().map(|f| Resonator::new(f - 0.03, 5_000.0, 0.8)));
    let plan = allocator()
        .plan(&guesses, &linear_offsets(-0.1, 0.1, 21))
        .unwrap();

    let outcome = sequencer().run(&mut device, &plan, 0).unwrap();
    let estimates =
        ResonanceConsolidator::default().refine(&outcome.sweep, &guesses, &ParabolicMinimum);

    assert_eq!(estimates.len(), guesses.len());
    for (estimate, guess) in estimates.iter().zip(guesses) {
        assert_eq!(estimate.guess, guess);
        assert_ne!(estimate.source, EstimateSource::PriorGuess);
        assert!(
            (estimate.chosen - (guess - 0.03)).abs() < 0.02,
            "guess {guess} moved to {}",
            estimate.chosen
        );
    }
}

#[test]
fn test_sweeps_and_timestreams_survive_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs").join("tracking.json");
    let mut device = device();
    let sequencer = sequencer();
    let allocator = allocator();
    let offsets = linear_offsets(-0.05, 0.05, 11);
    let mut writer = ReadoutFileWriter::new(&path).with_provenance("integration test");

    let mut guesses = TRUE_RESONANCES.to_vec();
    for iteration in 0..2 {
        let plan = allocator.plan(&guesses, &offsets).unwrap();
        let outcome = sequencer.run(&mut device, &plan, iteration).unwrap();
        writer
            .log_hw_state(device.hardware_record(f64::from(iteration)))
            .unwrap();
        writer.add_sweep(&outcome.sweep).unwrap();
        guesses = ResonanceConsolidator::default()
            .refine(&outcome.sweep, &guesses, &ParabolicMinimum)
            .iter()
            .map(|e| e.chosen)
            .collect();
    }
    let captured = sequencer
        .capture_timestreams(&mut device, &allocator, &guesses, 8)
        .unwrap();
    assert_eq!(captured.blocks.len(), TRUE_RESONANCES.len());
    writer.add_timestream(&captured.blocks).unwrap();
    writer.save().unwrap();

    let file = ReadoutFile::open(&path).unwrap();
    assert_eq!(file.provenance, "integration test");
    assert!(file.warnings().is_empty(), "{:?}", file.warnings());
    assert_eq!(file.sweeps.len(), 2);
    assert_eq!(file.timestreams.len(), 1);

    let sweep = file.sweep("sweep_1").unwrap();
    assert_eq!(sweep.len(), TRUE_RESONANCES.len() * offsets.len());
    let trace = sweep.trace_near_frequency(180.0).unwrap();
    assert_eq!(trace.freqs.len(), offsets.len());
    assert!(trace.freqs.windows(2).all(|w| w[0] < w[1]));
    let deepest = trace
        .s21
        .iter()
        .map(|s| s.norm())
        .fold(f64::INFINITY, f64::min);
    assert!(deepest < 0.5);

    // eight tones loaded when the records were taken: 5 real plus 3 placeholders
    let atten = file.effective_dac_atten_at(1.5).unwrap();
    assert_eq!(atten.ntones, 8);
    assert!((atten.total - 10.0 * 2f64.log10()).abs() < 1e-12);
    assert!(file.effective_dac_atten_at(-1.0).is_none());

    let timestream = file.timestream("timestream_0").unwrap();
    assert!(timestream.sweep_index.is_none());
    assert_eq!(timestream.num_data_samples(), 8 * 256 / 4);
    // blocks come in batch order
    let mut measured = timestream.measurement_freq();
    measured.sort_by(f64::total_cmp);
    for (measured, guess) in measured.iter().zip(&guesses) {
        assert!((measured - guess).abs() < 0.01);
    }
}

#[test]
fn test_random_failures_leave_gaps_not_errors() {
    let guesses = TRUE_RESONANCES.to_vec();
    let plan = allocator()
        .plan(&guesses, &linear_offsets(-0.05, 0.05, 11))
        .unwrap();
    let mut device = device().with_seed(11).with_failure_rate(0.3);

    let outcome = SweepSequencer::new(SequencerConfig {
        max_retries: 0,
        ..sequencer().config().clone()
    })
    .run(&mut device, &plan, 0)
    .unwrap();

    assert!(!outcome.is_complete());
    let expected = TRUE_RESONANCES.len() * 11;
    assert!(outcome.sweep.len() < expected);
    for failure in &outcome.failures {
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.is_recoverable());
    }
}
