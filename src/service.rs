//! Service surface for a remote coordinator.
//!
//! A coordinator drives the readout with two calls: choose which channels to stream
//! ([`ReadoutService::set_channel_ids`]) and collect one capture of them
//! ([`ReadoutService::get_data`]). The RPC wrapper around this trait lives elsewhere.
//!
//! [`Coordinator`] owns the device behind a `tokio::sync::Mutex`, so one capture holds the
//! board link at a time. Captures are synchronous and run on the blocking pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{ReadoutError, Result};
use crate::hardware::ReadoutDevice;
use crate::sweep::{epoch_seconds, SweepSequencer, ToneAllocator};

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    /// Frames to read per batch.
    pub nframes: usize,
    /// Return the raw samples of every channel as well.
    #[serde(default)]
    pub include_samples: bool,
}

impl Default for DataRequest {
    fn default() -> Self {
        Self {
            nframes: 8,
            include_samples: false,
        }
    }
}

/// Data product of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelData {
    /// Channel id as set with `set_tones`.
    pub channel_id: usize,
    /// Requested tone frequency, MHz.
    pub requested_frequency: f64,
    /// Frequency actually synthesized, MHz.
    pub frequency: f64,
    /// Tone-table index.
    pub tone: usize,
    /// FFT bin read.
    pub fft_bin: usize,
    /// Calibrated mean S21 as `[re, im]`.
    pub s21: [f64; 2],
    /// Standard deviation of the calibrated samples.
    pub std: f64,
    /// Raw samples as `[re, im]` pairs, when requested.
    pub samples: Option<Vec<[f64; 2]>>,
}

/// Result of one `get_data` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResponse {
    /// Capture start, seconds since the UNIX epoch.
    pub epoch: f64,
    /// Wave normalization of the loaded tones.
    pub wave_norm: f64,
    /// One entry per channel that was read, in request order.
    pub channels: Vec<ChannelData>,
    /// Batches given up on, as messages.
    pub failures: Vec<String>,
}

/// Calls a remote coordinator makes on a readout.
#[async_trait]
pub trait ReadoutService: Send + Sync {
    /// Choose the channels streamed by the next `get_data`.
    async fn set_channel_ids(&self, ids: Vec<usize>) -> Result<()>;

    /// Capture the selected channels once.
    async fn get_data(&self, request: DataRequest) -> Result<DataResponse>;
}

#[derive(Debug, Default)]
struct ChannelState {
    tones: Vec<f64>,
    channel_ids: Vec<usize>,
}

/// Readout service over one exclusively owned device.
pub struct Coordinator<D> {
    device: Arc<Mutex<D>>,
    allocator: ToneAllocator,
    sequencer: SweepSequencer,
    state: Mutex<ChannelState>,
}

impl<D: ReadoutDevice + 'static> Coordinator<D> {
    /// Take ownership of a device.
    pub fn new(device: D, allocator: ToneAllocator, sequencer: SweepSequencer) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            allocator,
            sequencer,
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Shared handle to the device, for work outside the service calls.
    pub fn device(&self) -> Arc<Mutex<D>> {
        Arc::clone(&self.device)
    }

    /// Define the tone of every channel id and select all of them.
    pub async fn set_tones(&self, tones: Vec<f64>) -> Result<()> {
        for freq in &tones {
            self.allocator.tone_index(*freq)?;
        }
        let mut state = self.state.lock().await;
        state.channel_ids = (0..tones.len()).collect();
        state.tones = tones;
        info!(channels = state.tones.len(), "tones set");
        Ok(())
    }

    /// Currently selected channel ids.
    pub async fn channel_ids(&self) -> Vec<usize> {
        self.state.lock().await.channel_ids.clone()
    }
}

#[async_trait]
impl<D: ReadoutDevice + 'static> ReadoutService for Coordinator<D> {
    async fn set_channel_ids(&self, ids: Vec<usize>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(id) = ids.iter().find(|id| **id >= state.tones.len()) {
            return Err(ReadoutError::Validation(format!(
                "channel id {id} has no tone, {} tones set",
                state.tones.len()
            )));
        }
        debug!(?ids, "channels selected");
        state.channel_ids = ids;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_data(&self, request: DataRequest) -> Result<DataResponse> {
        let (ids, tones) = {
            let state = self.state.lock().await;
            (state.channel_ids.clone(), state.tones.clone())
        };
        if ids.is_empty() {
            return Err(ReadoutError::Validation("no channels selected".to_string()));
        }
        // allocation sorts by frequency; keep the same order to map channel ids back
        let mut order = ids.clone();
        order.sort_by(|a, b| tones[*a].total_cmp(&tones[*b]));
        let freqs: Vec<f64> = order.iter().map(|id| tones[*id]).collect();

        let mut device = Arc::clone(&self.device).lock_owned().await;
        let allocator = self.allocator.clone();
        let sequencer = self.sequencer.clone();
        let nframes = request.nframes;
        let epoch = epoch_seconds();
        let outcome = tokio::task::spawn_blocking(move || {
            sequencer.capture_timestreams(&mut *device, &allocator, &freqs, nframes)
        })
        .await
        .map_err(|err| ReadoutError::hardware(format!("capture task failed: {err}")))??;

        let mut channels: Vec<ChannelData> = outcome
            .blocks
            .iter()
            .filter_map(|block| {
                let meta = block.meta();
                let channel_id = *order.get(meta.channel_id)?;
                let mean = block.mean();
                Some(ChannelData {
                    channel_id,
                    requested_frequency: tones[channel_id],
                    frequency: block.frequency(),
                    tone: meta.tone,
                    fft_bin: meta.fft_bin,
                    s21: [mean.re, mean.im],
                    std: block.std(),
                    samples: request
                        .include_samples
                        .then(|| block.samples().iter().map(|s| [s.re, s.im]).collect()),
                })
            })
            .collect();
        channels.sort_by_key(|c| ids.iter().position(|id| *id == c.channel_id));

        let epoch = outcome
            .blocks
            .iter()
            .map(|b| b.meta().t0)
            .reduce(f64::min)
            .unwrap_or(epoch);
        info!(
            channels = channels.len(),
            failures = outcome.failures.len(),
            "data served"
        );
        Ok(DataResponse {
            epoch,
            wave_norm: outcome.blocks.first().map_or(1.0, |b| b.meta().wave_norm),
            channels,
            failures: outcome
                .failures
                .iter()
                .map(|f| format!("batch {:?}: {}", f.batch, f.error))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::{Resonator, SimulatedReadout};
    use crate::sweep::SequencerConfig;
    use std::time::Duration;

    fn coordinator() -> Coordinator<SimulatedReadout> {
        let device = SimulatedReadout::new(512.0, 1 << 14, 1 << 16, 256)
            .with_resonators([Resonator::new(150.0, 20_000.0, 0.8)]);
        let allocator = ToneAllocator::new(512.0, 1 << 16, 1 << 14, 2).unwrap();
        let sequencer = SweepSequencer::new(SequencerConfig {
            reads_per_step: 4,
            settle: Duration::ZERO,
            batch_settle: Duration::ZERO,
            max_retries: 0,
            filter_length: 16,
        });
        Coordinator::new(device, allocator, sequencer)
    }

    #[tokio::test]
    async fn get_data_returns_selected_channels_in_request_order() {
        let service = coordinator();
        service.set_tones(vec![300.0, 150.0, 100.0]).await.unwrap();
        service.set_channel_ids(vec![2, 1]).await.unwrap();

        let response = service
            .get_data(DataRequest {
                nframes: 4,
                include_samples: true,
            })
            .await
            .unwrap();

        let ids: Vec<usize> = response.channels.iter().map(|c| c.channel_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(response.failures.is_empty());
        let on_resonance = &response.channels[1];
        let magnitude = on_resonance.s21[0].hypot(on_resonance.s21[1]);
        assert!(magnitude < 0.5, "expected a dip, got {magnitude}");
        assert!((on_resonance.frequency - 150.0).abs() < 0.01);
        assert_eq!(on_resonance.samples.as_ref().unwrap().len(), 4 * 256 / 2);
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected() {
        let service = coordinator();
        service.set_tones(vec![100.0]).await.unwrap();
        assert!(matches!(
            service.set_channel_ids(vec![1]).await,
            Err(ReadoutError::Validation(_))
        ));
        assert_eq!(service.channel_ids().await, vec![0]);
    }

    #[tokio::test]
    async fn nothing_selected_is_an_error() {
        let service = coordinator();
        assert!(service.get_data(DataRequest::default()).await.is_err());
        assert!(service.set_tones(vec![600.0]).await.is_err());
    }
}
