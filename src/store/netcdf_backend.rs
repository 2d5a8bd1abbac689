//! netCDF container backend (read only).
//!
//! Maps a netCDF-4 file onto [`Group`]: text attributes become attributes, numeric
//! variables are read as `f64` with their dimension lengths as shape, and sub-groups are
//! visited recursively. Complex arrays are expected with a trailing dimension of 2.

use std::path::Path;

use super::container::{Group, Variable};
use crate::error::{ReadoutError, Result};

fn nc_error(err: netcdf::Error) -> ReadoutError {
    ReadoutError::store(format!("netCDF: {err}"))
}

/// Read a netCDF file into a container.
pub fn load(path: &Path) -> Result<Group> {
    let file = netcdf::open(path).map_err(nc_error)?;
    let root = file
        .root()
        .ok_or_else(|| ReadoutError::store(format!("{} has no root group", path.display())))?;
    convert(&root, String::new())
}

fn convert(nc: &netcdf::Group<'_>, name: String) -> Result<Group> {
    let mut group = Group::new(name);
    for attribute in nc.attributes() {
        if let Ok(netcdf::AttributeValue::Str(text)) = attribute.value() {
            group.set_attribute(attribute.name(), text);
        }
    }
    for variable in nc.variables() {
        let shape: Vec<usize> = variable.dimensions().iter().map(|d| d.len()).collect();
        let values: Vec<f64> = variable.get_values::<f64, _>(..).map_err(nc_error)?;
        group.set_variable(variable.name(), Variable { shape, values });
    }
    for child in nc.groups() {
        let child_name = child.name();
        group.add_group(convert(&child, child_name)?);
    }
    Ok(group)
}
