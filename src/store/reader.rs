//! Read-side projections of a readout file.
//!
//! Every group is loaded against an explicit schema: required fields fail the load with
//! [`ReadoutError::Store`], optional fields fall back to a documented default and add a
//! [`CalibrationWarning`] (also logged) to the projection.

use num_complex::Complex;
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use super::container::Group;
use super::load_container;
use crate::error::{CalibrationWarning, ReadoutError, Result};
use crate::model::EnvironmentTags;

/// Root attribute holding free-form provenance text.
pub const PROVENANCE_ATTRIBUTE: &str = "provenance";

/// Power correction in dB for `ntones` simultaneous tones.
///
/// Zero up to four tones, then `10 * log10(ntones / 4)`.
pub fn ntone_power_correction(ntones: usize) -> f64 {
    10.0 * (ntones.max(4) as f64 / 4.0).log10()
}

fn warn_and_keep(warnings: &mut Vec<CalibrationWarning>, warning: CalibrationWarning) {
    warn!(%warning, "calibration metadata missing");
    warnings.push(warning);
}

/// One hardware-state record, as logged by the writer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareRecord {
    /// Seconds since the UNIX epoch.
    pub epoch: f64,
    /// ADC attenuation in dB.
    pub adc_atten: f64,
    /// DAC attenuation in dB.
    pub dac_atten: f64,
    /// Tones loaded at the time, if known.
    pub ntones: Option<usize>,
}

/// Attenuation in effect at some time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveAttenuation {
    /// Stored DAC attenuation in dB.
    pub dac_atten: f64,
    /// Tone count the correction used.
    pub ntones: usize,
    /// DAC attenuation plus the tone-count correction.
    pub total: f64,
}

/// The time-indexed hardware-state table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareState {
    /// Record times, ascending.
    pub epoch: Vec<f64>,
    /// ADC attenuation per record.
    pub adc_atten: Vec<f64>,
    /// DAC attenuation per record.
    pub dac_atten: Vec<f64>,
    /// Tone count per record, when stored.
    pub ntones: Option<Vec<usize>>,
}

impl HardwareState {
    fn load(group: &Group, warnings: &mut Vec<CalibrationWarning>) -> Result<Self> {
        let epoch = group.require("epoch")?.values.clone();
        let adc_atten = group.require("adc_atten")?.values.clone();
        let dac_atten = group.require("dac_atten")?.values.clone();
        if adc_atten.len() != epoch.len() || dac_atten.len() != epoch.len() {
            return Err(ReadoutError::store(
                "hw_state columns have different lengths".to_string(),
            ));
        }
        let ntones = match group.variable("ntones") {
            Some(variable) => Some(variable.values.iter().map(|n| *n as usize).collect()),
            None => {
                warn_and_keep(warnings, CalibrationWarning::MissingToneCount);
                None
            }
        };
        Ok(Self {
            epoch,
            adc_atten,
            dac_atten,
            ntones,
        })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.epoch.len()
    }

    /// True when nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.epoch.is_empty()
    }

    /// The last record at or before `epoch`.
    pub fn record_at(&self, epoch: f64) -> Option<HardwareRecord> {
        let position = self.epoch.partition_point(|t| *t <= epoch).checked_sub(1)?;
        Some(HardwareRecord {
            epoch: self.epoch[position],
            adc_atten: self.adc_atten[position],
            dac_atten: self.dac_atten[position],
            ntones: self.ntones.as_ref().and_then(|n| n.get(position).copied()),
        })
    }

    /// DAC attenuation corrected for the tone count, at `epoch`.
    ///
    /// `None` before the first record. A missing tone count is taken as one tone.
    pub fn effective_dac_atten_at(&self, epoch: f64) -> Option<EffectiveAttenuation> {
        let record = self.record_at(epoch)?;
        let ntones = record.ntones.unwrap_or(1);
        Some(EffectiveAttenuation {
            dac_atten: record.dac_atten,
            ntones,
            total: record.dac_atten + ntone_power_correction(ntones),
        })
    }
}

/// Blocks of one capture session stored side by side.
#[derive(Debug, Clone)]
pub struct TimestreamGroup {
    name: String,
    raw: Vec<Vec<Complex<f64>>>,
    /// Sample spacing per block, microseconds.
    pub dt: Vec<f64>,
    /// ADC sampling frequency per block, MHz.
    pub fs: Vec<f64>,
    /// Tone-table index per block.
    pub tone: Vec<f64>,
    /// Tone-table size per block.
    pub nsamp: Vec<f64>,
    /// FFT bin per block.
    pub fftbin: Vec<f64>,
    /// FFT size per block.
    pub nfft: Vec<f64>,
    /// Capture start per block, seconds since the UNIX epoch.
    pub epoch: Vec<f64>,
    /// Wave normalization per block, when stored.
    pub wave_norm: Option<Vec<f64>>,
    /// Offset step per block, when stored.
    pub sweep_index: Option<Vec<usize>>,
    /// Environmental tags per block, when stored.
    pub tags: Option<Vec<EnvironmentTags>>,
    scaled: OnceCell<Vec<Vec<Complex<f64>>>>,
    warnings: Vec<CalibrationWarning>,
}

const TAG_FIELDS: [&str; 4] = [
    "mmw_source_freq",
    "mmw_source_modulation_freq",
    "zbd_power_dbm",
    "zbd_voltage",
];

impl TimestreamGroup {
    /// Load a time-stream group.
    pub fn load(group: &Group) -> Result<Self> {
        let name = group.name.clone();
        let mut warnings = Vec::new();
        let raw = group.require("data")?.to_complex_rows()?;
        let blocks = raw.len();
        let column = |field: &str| -> Result<Vec<f64>> {
            let values = group.require(field)?.values.clone();
            if values.len() != blocks {
                return Err(ReadoutError::store(format!(
                    "'{field}' of '{}' has {} entries for {blocks} blocks",
                    group.name,
                    values.len()
                )));
            }
            Ok(values)
        };
        let dt = column("dt")?;
        let fs = column("fs")?;
        let tone = column("tone")?;
        let nsamp = column("nsamp")?;

        let mut defaulted = |field: &str, default: f64| -> Result<Vec<f64>> {
            if group.variable(field).is_some() {
                column(field)
            } else {
                warn_and_keep(
                    &mut warnings,
                    CalibrationWarning::MissingField {
                        group: group.name.clone(),
                        field: field.to_string(),
                    },
                );
                Ok(vec![default; blocks])
            }
        };
        let fftbin = defaulted("fftbin", 0.0)?;
        let nfft = defaulted("nfft", crate::config::HardwareConfig::default().nfft as f64)?;
        let epoch = defaulted("epoch", 0.0)?;

        let wave_norm = if group.variable("wavenorm").is_some() {
            Some(column("wavenorm")?)
        } else {
            warn_and_keep(
                &mut warnings,
                CalibrationWarning::MissingWaveNormalization { group: name.clone() },
            );
            None
        };
        let sweep_index = if group.variable("sweep_index").is_some() {
            Some(column("sweep_index")?.iter().map(|i| *i as usize).collect())
        } else {
            None
        };

        let present: Vec<bool> = TAG_FIELDS.iter().map(|f| group.variable(f).is_some()).collect();
        let tags = if present.iter().any(|p| *p) {
            let mut values = Vec::with_capacity(TAG_FIELDS.len());
            for (field, present) in TAG_FIELDS.iter().zip(&present) {
                if *present {
                    values.push(column(field)?);
                } else {
                    warn_and_keep(
                        &mut warnings,
                        CalibrationWarning::MissingField {
                            group: name.clone(),
                            field: field.to_string(),
                        },
                    );
                    values.push(vec![0.0; blocks]);
                }
            }
            Some(
                (0..blocks)
                    .map(|i| EnvironmentTags {
                        mmw_source_freq: values[0][i],
                        mmw_source_modulation_freq: values[1][i],
                        zbd_power_dbm: values[2][i],
                        zbd_voltage: values[3][i],
                    })
                    .collect(),
            )
        } else {
            None
        };

        Ok(Self {
            name,
            raw,
            dt,
            fs,
            tone,
            nsamp,
            fftbin,
            nfft,
            epoch,
            wave_norm,
            sweep_index,
            tags,
            scaled: OnceCell::new(),
            warnings,
        })
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// True when the group holds no block.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Low-confidence conditions found while loading.
    pub fn warnings(&self) -> &[CalibrationWarning] {
        &self.warnings
    }

    /// Measured tone frequency per block, MHz: `fs * tone / nsamp`.
    pub fn measurement_freq(&self) -> Vec<f64> {
        self.fs
            .iter()
            .zip(&self.tone)
            .zip(&self.nsamp)
            .map(|((fs, tone), nsamp)| fs * tone / nsamp)
            .collect()
    }

    /// Sample rate per block in Hz: `fs * 1e6 / (2 * nfft)`.
    pub fn sample_rate(&self) -> Vec<f64> {
        self.fs
            .iter()
            .zip(&self.nfft)
            .map(|(fs, nfft)| fs * 1e6 / (2.0 * nfft))
            .collect()
    }

    /// Samples per block.
    pub fn num_data_samples(&self) -> usize {
        self.raw.first().map_or(0, Vec::len)
    }

    /// Duration of each block in seconds.
    pub fn data_len_seconds(&self) -> Vec<f64> {
        let samples = self.num_data_samples() as f64;
        self.sample_rate().iter().map(|rate| samples / rate).collect()
    }

    fn norm(&self, block: usize) -> f64 {
        self.wave_norm.as_ref().map_or(1.0, |norm| norm[block])
    }

    /// All blocks scaled by their wave normalization, computed once.
    pub fn data(&self) -> &[Vec<Complex<f64>>] {
        self.scaled.get_or_init(|| {
            (0..self.raw.len())
                .map(|block| self.scale(block))
                .collect()
        })
    }

    fn scale(&self, block: usize) -> Vec<Complex<f64>> {
        let norm = self.norm(block);
        self.raw[block].iter().map(|s| s * norm).collect()
    }

    /// One scaled block, without filling the cache.
    pub fn block_data(&self, block: usize) -> Result<Vec<Complex<f64>>> {
        if block >= self.raw.len() {
            return Err(ReadoutError::store(format!(
                "block {block} out of range, '{}' has {}",
                self.name,
                self.raw.len()
            )));
        }
        Ok(match self.scaled.get() {
            Some(scaled) => scaled[block].clone(),
            None => self.scale(block),
        })
    }

    /// Earliest block start.
    pub fn start_epoch(&self) -> Option<f64> {
        self.epoch.iter().copied().reduce(f64::min)
    }

    /// Latest block start.
    pub fn end_epoch(&self) -> Option<f64> {
        self.epoch.iter().copied().reduce(f64::max)
    }
}

/// Points of a stored sweep selection, in ascending frequency order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredTrace {
    /// Frequencies in MHz.
    pub freqs: Vec<f64>,
    /// S21 estimates.
    pub s21: Vec<Complex<f64>>,
    /// Standard errors of the mean, real and imaginary parts separately.
    pub errors: Vec<Complex<f64>>,
}

/// A stored sweep with its block-level time streams.
#[derive(Debug, Clone)]
pub struct SweepGroup {
    name: String,
    /// Frequency of each point, MHz.
    pub frequency: Vec<f64>,
    /// S21 of each point.
    pub s21: Vec<Complex<f64>>,
    /// Channel id of each point.
    pub index: Vec<usize>,
    /// Blocks the points were computed from, in point order.
    pub timestreams: TimestreamGroup,
}

impl SweepGroup {
    /// Load a sweep group.
    pub fn load(group: &Group) -> Result<Self> {
        let frequency = group.require("frequency")?.values.clone();
        let s21 = group.require("s21")?.to_complex()?;
        let index: Vec<usize> = group
            .require("index")?
            .values
            .iter()
            .map(|i| *i as usize)
            .collect();
        if s21.len() != frequency.len() || index.len() != frequency.len() {
            return Err(ReadoutError::store(format!(
                "sweep '{}' arrays have different lengths",
                group.name
            )));
        }
        let mut timestreams = TimestreamGroup::load(group.require_group("datablocks")?)?;
        if timestreams.sweep_index.is_none() {
            warn_and_keep(
                &mut timestreams.warnings,
                CalibrationWarning::MissingSweepIndex {
                    group: group.name.clone(),
                },
            );
        }
        Ok(Self {
            name: group.name.clone(),
            frequency,
            s21,
            index,
            timestreams,
        })
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.frequency.len()
    }

    /// True for an empty sweep.
    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }

    /// Standard error of each point: `(std(re) + i * std(im)) / sqrt(n)`.
    pub fn errors(&self) -> Vec<Complex<f64>> {
        self.timestreams
            .data()
            .iter()
            .map(|samples| {
                let n = samples.len() as f64;
                if samples.is_empty() {
                    return Complex::new(f64::NAN, f64::NAN);
                }
                let mean = samples.iter().sum::<Complex<f64>>() / n;
                let var_re = samples.iter().map(|s| (s.re - mean.re).powi(2)).sum::<f64>() / n;
                let var_im = samples.iter().map(|s| (s.im - mean.im).powi(2)).sum::<f64>() / n;
                Complex::new(var_re.sqrt(), var_im.sqrt()) / n.sqrt()
            })
            .collect()
    }

    fn select_where(&self, keep: impl Fn(usize) -> bool) -> StoredTrace {
        let errors = self.errors();
        let mut points: Vec<usize> = (0..self.len()).filter(|i| keep(*i)).collect();
        points.sort_by(|a, b| self.frequency[*a].total_cmp(&self.frequency[*b]));
        StoredTrace {
            freqs: points.iter().map(|i| self.frequency[*i]).collect(),
            s21: points.iter().map(|i| self.s21[*i]).collect(),
            errors: points
                .iter()
                .map(|i| errors.get(*i).copied().unwrap_or(Complex::new(f64::NAN, f64::NAN)))
                .collect(),
        }
    }

    /// Every point of one channel, in frequency order.
    pub fn select_by_index(&self, index: usize) -> StoredTrace {
        self.select_where(|i| self.index[i] == index)
    }

    /// Every point measured at one offset step, in frequency order.
    ///
    /// Empty when the blocks carry no sweep index.
    pub fn select_by_step(&self, step: usize) -> StoredTrace {
        match &self.timestreams.sweep_index {
            Some(steps) => self.select_where(|i| steps.get(i) == Some(&step)),
            None => StoredTrace::default(),
        }
    }

    /// The whole trace of the channel owning the point nearest to `freq`.
    pub fn trace_near_frequency(&self, freq: f64) -> Option<StoredTrace> {
        let nearest = (0..self.len()).min_by(|a, b| {
            (self.frequency[*a] - freq)
                .abs()
                .total_cmp(&(self.frequency[*b] - freq).abs())
        })?;
        Some(self.select_by_index(self.index[nearest]))
    }

    /// Earliest block start of the sweep.
    pub fn start_epoch(&self) -> Option<f64> {
        self.timestreams.start_epoch()
    }

    /// Latest block start of the sweep.
    pub fn end_epoch(&self) -> Option<f64> {
        self.timestreams.end_epoch()
    }
}

/// A loaded readout file.
#[derive(Debug, Clone)]
pub struct ReadoutFile {
    path: PathBuf,
    /// Free-form provenance text, empty when absent.
    pub provenance: String,
    /// Hardware-state table.
    pub hw_state: HardwareState,
    /// Sweep groups in file order.
    pub sweeps: Vec<SweepGroup>,
    /// Free-standing time-stream groups in file order.
    pub timestreams: Vec<TimestreamGroup>,
    warnings: Vec<CalibrationWarning>,
}

impl ReadoutFile {
    /// Open a readout file.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let root = load_container(path)?;
        let file = Self::from_container(&root, path)?;
        info!(
            sweeps = file.sweeps.len(),
            timestreams = file.timestreams.len(),
            warnings = file.warnings().len(),
            "readout file loaded"
        );
        Ok(file)
    }

    /// Project an in-memory container.
    pub fn from_container(root: &Group, path: &Path) -> Result<Self> {
        let mut warnings = Vec::new();
        let hw_state = HardwareState::load(root.require_group("hw_state")?, &mut warnings)?;
        let sweeps = match root.group("sweeps") {
            Some(group) => group
                .groups
                .iter()
                .map(SweepGroup::load)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let timestreams = match root.group("timestreams") {
            Some(group) => group
                .groups
                .iter()
                .map(TimestreamGroup::load)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            provenance: root
                .attribute(PROVENANCE_ATTRIBUTE)
                .unwrap_or_default()
                .to_string(),
            hw_state,
            sweeps,
            timestreams,
            warnings,
        })
    }

    /// File the projection was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sweep group by name.
    pub fn sweep(&self, name: &str) -> Option<&SweepGroup> {
        self.sweeps.iter().find(|s| s.name() == name)
    }

    /// Time-stream group by name.
    pub fn timestream(&self, name: &str) -> Option<&TimestreamGroup> {
        self.timestreams.iter().find(|t| t.name() == name)
    }

    /// Every low-confidence condition found in the file.
    pub fn warnings(&self) -> Vec<CalibrationWarning> {
        let mut all = self.warnings.clone();
        for sweep in &self.sweeps {
            all.extend(sweep.timestreams.warnings().iter().cloned());
        }
        for timestream in &self.timestreams {
            all.extend(timestream.warnings().iter().cloned());
        }
        all
    }

    /// DAC attenuation in effect at `epoch`, corrected for the tone count.
    pub fn effective_dac_atten_at(&self, epoch: f64) -> Option<EffectiveAttenuation> {
        self.hw_state.effective_dac_atten_at(epoch)
    }
}
