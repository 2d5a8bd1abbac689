//! Persisted store.
//!
//! Layout of a readout file:
//!
//! ```text
//! /                   provenance text attribute
//! /hw_state           epoch, adc_atten, dac_atten, [ntones]
//! /sweeps/<name>      frequency, s21, index, datablocks/ (time-stream group)
//! /timestreams/<name> data, dt, fs, tone, nsamp, fftbin, nfft, epoch,
//!                     [wavenorm], [sweep_index], [mmw_source_freq, ...]
//! ```
//!
//! Files ending in `.nc` are read with the netCDF backend (feature `storage_netcdf`);
//! everything else uses JSON.

pub mod container;
pub mod json;
#[cfg(feature = "storage_netcdf")]
pub mod netcdf_backend;
pub mod reader;
pub mod writer;

pub use container::{Group, Variable};
pub use reader::{
    ntone_power_correction, EffectiveAttenuation, HardwareRecord, HardwareState, ReadoutFile,
    StoredTrace, SweepGroup, TimestreamGroup,
};
pub use writer::ReadoutFileWriter;

use std::path::Path;

use crate::error::{ReadoutError, Result};

fn is_netcdf(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "nc")
}

/// Load a container from disk, choosing the backend by extension.
pub fn load_container(path: &Path) -> Result<Group> {
    if is_netcdf(path) {
        return load_netcdf(path);
    }
    json::load(path)
}

#[cfg(feature = "storage_netcdf")]
fn load_netcdf(path: &Path) -> Result<Group> {
    netcdf_backend::load(path)
}

#[cfg(not(feature = "storage_netcdf"))]
fn load_netcdf(path: &Path) -> Result<Group> {
    Err(ReadoutError::store(format!(
        "{} is netCDF; rebuild with the storage_netcdf feature",
        path.display()
    )))
}

/// Save a container to disk.
pub fn save_container(root: &Group, path: &Path) -> Result<()> {
    if is_netcdf(path) {
        return Err(ReadoutError::store(format!(
            "writing netCDF is not supported, use a .json path instead of {}",
            path.display()
        )));
    }
    json::save(root, path)
}
