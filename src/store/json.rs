//! JSON container backend.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use super::container::Group;
use crate::error::Result;

/// Write a container as JSON.
pub fn save(root: &Group, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, root)?;
    writer.flush()?;
    Ok(())
}

/// Read a container written by [`save`].
pub fn load(path: &Path) -> Result<Group> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
