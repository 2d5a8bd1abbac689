//! Write-side of the readout file.
//!
//! The writer accumulates hardware records, sweeps and time-stream captures in memory and
//! serializes the whole container on [`ReadoutFileWriter::save`]. Raw samples are stored
//! unscaled next to their wave normalization, matching what the reader expects.

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::container::{Group, Variable};
use super::reader::{HardwareRecord, PROVENANCE_ATTRIBUTE};
use super::save_container;
use crate::error::{ReadoutError, Result};
use crate::model::{DataBlock, SweepData};

/// Builder for a readout file.
#[derive(Debug, Clone)]
pub struct ReadoutFileWriter {
    path: PathBuf,
    provenance: String,
    hw_records: Vec<HardwareRecord>,
    sweeps: Vec<Group>,
    timestreams: Vec<Group>,
}

impl ReadoutFileWriter {
    /// Start an empty file that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            provenance: String::new(),
            hw_records: Vec::new(),
            sweeps: Vec::new(),
            timestreams: Vec::new(),
        }
    }

    /// Attach provenance text.
    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        self.provenance = provenance.into();
        self
    }

    /// Destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one hardware-state record. Records must be logged in time order.
    pub fn log_hw_state(&mut self, record: HardwareRecord) -> Result<()> {
        if let Some(last) = self.hw_records.last() {
            if record.epoch < last.epoch {
                return Err(ReadoutError::Validation(format!(
                    "hardware record at {} precedes the last record at {}",
                    record.epoch, last.epoch
                )));
            }
        }
        debug!(?record, "hardware state logged");
        self.hw_records.push(record);
        Ok(())
    }

    /// Add a sweep; returns the group name.
    pub fn add_sweep(&mut self, sweep: &SweepData) -> Result<String> {
        let name = format!("sweep_{}", self.sweeps.len());
        let mut group = Group::new(&name);
        group.set_attribute("sweep_id", sweep.sweep_id().to_string());
        group.set_variable("frequency", Variable::vector(sweep.freqs().to_vec()));
        group.set_variable("s21", Variable::complex(&sweep.data()));
        group.set_variable(
            "index",
            Variable::vector(sweep.channel_ids().iter().map(|i| *i as f64).collect()),
        );
        group.add_group(blocks_group("datablocks", sweep.blocks())?);
        debug!(name = %name, points = sweep.len(), "sweep added");
        self.sweeps.push(group);
        Ok(name)
    }

    /// Add a free-standing capture; returns the group name.
    pub fn add_timestream(&mut self, blocks: &[DataBlock]) -> Result<String> {
        let name = format!("timestream_{}", self.timestreams.len());
        self.timestreams.push(blocks_group(&name, blocks)?);
        debug!(name = %name, blocks = blocks.len(), "time stream added");
        Ok(name)
    }

    /// Build the in-memory container.
    pub fn to_container(&self) -> Group {
        let mut root = Group::new("");
        root.set_attribute(PROVENANCE_ATTRIBUTE, self.provenance.clone());

        let hw = root.group_mut("hw_state");
        let column = |get: fn(&HardwareRecord) -> f64| {
            Variable::vector(self.hw_records.iter().map(get).collect())
        };
        hw.set_variable("epoch", column(|r| r.epoch));
        hw.set_variable("adc_atten", column(|r| r.adc_atten));
        hw.set_variable("dac_atten", column(|r| r.dac_atten));
        let ntones: Option<Vec<f64>> = self
            .hw_records
            .iter()
            .map(|r| r.ntones.map(|n| n as f64))
            .collect();
        match ntones {
            Some(ntones) => hw.set_variable("ntones", Variable::vector(ntones)),
            None => warn!("tone count unknown for some hardware records, not stored"),
        }

        root.group_mut("sweeps").groups = self.sweeps.clone();
        root.group_mut("timestreams").groups = self.timestreams.clone();
        root
    }

    /// Serialize everything to the destination path.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn save(&self) -> Result<()> {
        save_container(&self.to_container(), &self.path)?;
        info!(
            sweeps = self.sweeps.len(),
            timestreams = self.timestreams.len(),
            hw_records = self.hw_records.len(),
            "readout file saved"
        );
        Ok(())
    }
}

fn blocks_group(name: &str, blocks: &[DataBlock]) -> Result<Group> {
    let mut group = Group::new(name);
    let rows: Vec<&[_]> = blocks.iter().map(DataBlock::samples).collect();
    group.set_variable("data", Variable::complex_rows(&rows)?);

    let column = |get: &dyn Fn(&DataBlock) -> f64| {
        Variable::vector(blocks.iter().map(get).collect())
    };
    group.set_variable("dt", column(&|b| b.meta().dt()));
    group.set_variable("fs", column(&|b| b.meta().sample_rate));
    group.set_variable("tone", column(&|b| b.meta().tone as f64));
    group.set_variable("nsamp", column(&|b| b.meta().tone_table_size as f64));
    group.set_variable("fftbin", column(&|b| b.meta().fft_bin as f64));
    group.set_variable("nfft", column(&|b| b.meta().nfft as f64));
    group.set_variable("epoch", column(&|b| b.meta().t0));
    group.set_variable("wavenorm", column(&|b| b.meta().wave_norm));

    let steps: Option<Vec<f64>> = blocks
        .iter()
        .map(|b| b.meta().sweep_index.map(|i| i as f64))
        .collect();
    if let Some(steps) = steps.filter(|s| !s.is_empty()) {
        group.set_variable("sweep_index", Variable::vector(steps));
    }

    if !blocks.is_empty() && blocks.iter().all(|b| b.meta().tags.is_some()) {
        let tag = |get: fn(&crate::model::EnvironmentTags) -> f64| {
            column(&|b| b.meta().tags.as_ref().map_or(0.0, get))
        };
        group.set_variable("mmw_source_freq", tag(|t| t.mmw_source_freq));
        group.set_variable(
            "mmw_source_modulation_freq",
            tag(|t| t.mmw_source_modulation_freq),
        );
        group.set_variable("zbd_power_dbm", tag(|t| t.zbd_power_dbm));
        group.set_variable("zbd_voltage", tag(|t| t.zbd_voltage));
    }
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockMeta, EnvironmentTags};
    use crate::store::ReadoutFile;
    use num_complex::Complex;

    fn block(tone: usize, sweep_index: Option<usize>, channel_id: usize) -> DataBlock {
        let meta = BlockMeta {
            tone,
            fft_bin: tone / 4,
            tone_table_size: 1 << 16,
            nfft: 1 << 14,
            wave_norm: 0.5,
            t0: 100.0 + tone as f64,
            sample_rate: 512.0,
            sweep_index,
            channel_id,
            tags: None,
        };
        DataBlock::with_filter_length(vec![Complex::new(tone as f64, 1.0); 32], meta, 8)
    }

    #[test]
    fn written_sweep_reads_back() {
        let mut sweep = SweepData::new(7);
        for step in 0..3 {
            sweep.add_block(block(1000 + step, Some(step), 0));
            sweep.add_block(block(9000 + step, Some(step), 1));
        }
        let mut writer = ReadoutFileWriter::new("unused.json").with_provenance("bench run");
        writer
            .log_hw_state(HardwareRecord {
                epoch: 1.0,
                adc_atten: 20.0,
                dac_atten: 30.0,
                ntones: Some(8),
            })
            .unwrap();
        assert_eq!(writer.add_sweep(&sweep).unwrap(), "sweep_0");

        let file = ReadoutFile::from_container(&writer.to_container(), writer.path()).unwrap();
        assert_eq!(file.provenance, "bench run");
        assert!(file.warnings().is_empty());
        let stored = &file.sweeps[0];
        assert_eq!(stored.frequency, sweep.freqs());
        assert_eq!(stored.index, vec![0, 0, 0, 1, 1, 1]);
        // stored raw, scaled on read
        assert_eq!(stored.timestreams.data()[0][0], Complex::new(500.0, 0.5));
        assert_eq!(stored.select_by_step(2).freqs.len(), 2);
        assert_eq!(file.effective_dac_atten_at(5.0).unwrap().ntones, 8);
    }

    #[test]
    fn timestreams_omit_missing_sweep_index() {
        let mut writer = ReadoutFileWriter::new("unused.json");
        let mut tagged = block(200, None, 0);
        let mut meta = tagged.meta().clone();
        meta.tags = Some(EnvironmentTags {
            zbd_voltage: 0.3,
            ..Default::default()
        });
        tagged = DataBlock::new(tagged.samples().to_vec(), meta);

        assert_eq!(writer.add_timestream(&[tagged]).unwrap(), "timestream_0");
        let root = writer.to_container();
        let group = root.group("timestreams").unwrap().group("timestream_0").unwrap();
        assert!(group.variable("sweep_index").is_none());
        assert_eq!(group.variable("zbd_voltage").unwrap().values, vec![0.3]);
    }

    #[test]
    fn hardware_records_must_be_ordered() {
        let mut writer = ReadoutFileWriter::new("unused.json");
        let record = |epoch| HardwareRecord {
            epoch,
            adc_atten: 0.0,
            dac_atten: 0.0,
            ntones: None,
        };
        writer.log_hw_state(record(5.0)).unwrap();
        assert!(writer.log_hw_state(record(4.0)).is_err());
        let root = writer.to_container();
        assert!(root.group("hw_state").unwrap().variable("ntones").is_none());
    }

    #[test]
    fn ragged_blocks_are_rejected() {
        let short = DataBlock::new(vec![Complex::new(0.0, 0.0); 4], block(1, None, 0).meta().clone());
        let mut writer = ReadoutFileWriter::new("unused.json");
        assert!(matches!(
            writer.add_timestream(&[block(2, None, 0), short]),
            Err(ReadoutError::DataShape { .. })
        ));
    }
}
