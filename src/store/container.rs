//! Backend-neutral hierarchical container.
//!
//! A [`Group`] holds text attributes, named numeric variables and child groups in creation
//! order. A [`Variable`] is a shape plus row-major `f64` values; complex arrays carry a
//! trailing dimension of 2 (real, imaginary).

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ReadoutError, Result};

/// A numeric array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Dimensions, outermost first.
    pub shape: Vec<usize>,
    /// Row-major values; NaN is written as `null`.
    #[serde(with = "nan_as_null")]
    pub values: Vec<f64>,
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let values: Vec<Option<f64>> = values
            .iter()
            .map(|v| (!v.is_nan()).then_some(*v))
            .collect();
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

impl Variable {
    /// One-dimensional variable.
    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    /// Complex vector stored as `[n, 2]`.
    pub fn complex(values: &[Complex<f64>]) -> Self {
        Self {
            shape: vec![values.len(), 2],
            values: values.iter().flat_map(|c| [c.re, c.im]).collect(),
        }
    }

    /// Equal-length complex rows stored as `[rows, len, 2]`.
    pub fn complex_rows(rows: &[&[Complex<f64>]]) -> Result<Self> {
        let len = rows.first().map_or(0, |row| row.len());
        if let Some(row) = rows.iter().find(|row| row.len() != len) {
            return Err(ReadoutError::shape(format!(
                "rows of {} and {len} samples cannot share one array",
                row.len()
            )));
        }
        Ok(Self {
            shape: vec![rows.len(), len, 2],
            values: rows
                .iter()
                .flat_map(|row| row.iter().flat_map(|c| [c.re, c.im]))
                .collect(),
        })
    }

    /// Length of the outermost dimension.
    pub fn len(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// True when the outermost dimension is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that the value count matches the shape.
    pub fn validate(&self, name: &str) -> Result<()> {
        let expected: usize = self.shape.iter().product();
        if expected != self.values.len() {
            return Err(ReadoutError::store(format!(
                "variable '{name}' has shape {:?} but {} values",
                self.shape,
                self.values.len()
            )));
        }
        Ok(())
    }

    /// Values of a variable with a trailing dimension of 2, as complex numbers.
    pub fn to_complex(&self) -> Result<Vec<Complex<f64>>> {
        if self.shape.last() != Some(&2) {
            return Err(ReadoutError::store(format!(
                "complex variable needs a trailing dimension of 2, shape is {:?}",
                self.shape
            )));
        }
        Ok(self
            .values
            .chunks_exact(2)
            .map(|pair| Complex::new(pair[0], pair[1]))
            .collect())
    }

    /// Complex rows of a `[rows, len, 2]` variable.
    pub fn to_complex_rows(&self) -> Result<Vec<Vec<Complex<f64>>>> {
        let samples = self.to_complex()?;
        let [rows, len, _] = self.shape[..] else {
            return Err(ReadoutError::store(format!(
                "expected a [rows, samples, 2] array, shape is {:?}",
                self.shape
            )));
        };
        if rows == 0 {
            return Ok(Vec::new());
        }
        Ok(samples.chunks_exact(len.max(1)).map(<[_]>::to_vec).take(rows).collect())
    }
}

/// A named node of the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Group name; empty for the root.
    pub name: String,
    /// Text attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Numeric variables.
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
    /// Child groups in creation order.
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Group {
    /// Create an empty group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Child group by name.
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Child group by name, or a store error naming the parent.
    pub fn require_group(&self, name: &str) -> Result<&Group> {
        self.group(name).ok_or_else(|| {
            ReadoutError::store(format!("group '{name}' not found in '{}'", self.name))
        })
    }

    /// Mutable child group, created when absent.
    pub fn group_mut(&mut self, name: &str) -> &mut Group {
        let position = match self.groups.iter().position(|g| g.name == name) {
            Some(position) => position,
            None => {
                self.groups.push(Group::new(name));
                self.groups.len() - 1
            }
        };
        &mut self.groups[position]
    }

    /// Append a child group.
    pub fn add_group(&mut self, group: Group) {
        self.groups.push(group);
    }

    /// Variable by name.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    /// Variable by name, or a store error naming the group.
    pub fn require(&self, name: &str) -> Result<&Variable> {
        let variable = self.variable(name).ok_or_else(|| {
            ReadoutError::store(format!("variable '{name}' not found in '{}'", self.name))
        })?;
        variable.validate(name)?;
        Ok(variable)
    }

    /// Insert or replace a variable.
    pub fn set_variable(&mut self, name: impl Into<String>, variable: Variable) {
        self.variables.insert(name.into(), variable);
    }

    /// Text attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Insert or replace a text attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complex_rows_keep_layout() {
        let a = [Complex::new(1.0, 2.0), Complex::new(3.0, 4.0)];
        let b = [Complex::new(5.0, 6.0), Complex::new(7.0, 8.0)];
        let variable = Variable::complex_rows(&[&a, &b]).unwrap();
        assert_eq!(variable.shape, vec![2, 2, 2]);
        assert_eq!(variable.values[4..6], [5.0, 6.0]);
        assert_eq!(variable.to_complex_rows().unwrap()[1], b.to_vec());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let a = [Complex::new(1.0, 2.0)];
        let b = [Complex::new(5.0, 6.0), Complex::new(7.0, 8.0)];
        assert!(Variable::complex_rows(&[&a, &b]).is_err());
    }

    #[test]
    fn groups_keep_creation_order() {
        let mut root = Group::new("");
        root.group_mut("sweeps").add_group(Group::new("sweep_1"));
        root.group_mut("sweeps").add_group(Group::new("sweep_0"));
        let names: Vec<&str> = root.groups[0].groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["sweep_1", "sweep_0"]);
        assert_eq!(root.groups.len(), 1);
    }

    #[test]
    fn nan_survives_json() {
        let variable = Variable::vector(vec![1.0, f64::NAN]);
        let text = serde_json::to_string(&variable).unwrap();
        assert!(text.contains("null"));
        let back: Variable = serde_json::from_str(&text).unwrap();
        assert_eq!(back.values[0], 1.0);
        assert!(back.values[1].is_nan());
    }

    #[test]
    fn require_checks_shape() {
        let mut group = Group::new("hw_state");
        group.set_variable(
            "epoch",
            Variable {
                shape: vec![3],
                values: vec![1.0],
            },
        );
        assert!(matches!(group.require("epoch"), Err(ReadoutError::Store { .. })));
        assert!(group.require("dac_atten").is_err());
    }
}
