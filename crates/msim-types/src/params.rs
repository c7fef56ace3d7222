//! Input parameter values and their lineage.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};
use crate::{RunId, SetId};

// ── Value kind ────────────────────────────────────────────────────────────────

/// Element type of an input parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Values of one input parameter (one sub-value of it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValues {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
}

impl ParamValues {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Bool(_) => ValueKind::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a scalar run option value (`Parameter.Name=value`) as `kind`.
    pub fn parse_scalar(kind: ValueKind, text: &str) -> Result<Self> {
        let text = text.trim();
        let bad = || TypesError::ParamValue(format!("cannot parse {text:?} as {kind:?}"));
        match kind {
            ValueKind::Int => text.parse().map(|v| Self::Int(vec![v])).map_err(|_| bad()),
            ValueKind::Float => text.parse().map(|v| Self::Float(vec![v])).map_err(|_| bad()),
            ValueKind::Bool => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(Self::Bool(vec![true])),
                "0" | "false" | "no" => Ok(Self::Bool(vec![false])),
                _ => Err(bad()),
            },
        }
    }

    /// Check kind and element count against what the caller expects.
    pub fn expect_shape(&self, kind: ValueKind, size: usize) -> Result<()> {
        if self.kind() != kind {
            return Err(TypesError::ParamValue(format!(
                "expected {kind:?} values, found {:?}",
                self.kind()
            )));
        }
        if self.len() != size {
            return Err(TypesError::ParamValue(format!(
                "expected {size} values, found {}",
                self.len()
            )));
        }
        Ok(())
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_floats(&self) -> Option<&[f64]> {
        match self {
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bools(&self) -> Option<&[bool]> {
        match self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }
}

// ── Lineage ───────────────────────────────────────────────────────────────────

/// Where a run's copy of an input parameter came from.
///
/// Recorded once when the run is created and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterSource {
    /// `Parameter.<name>` run option (command line, profile).
    RunOption { value: String },
    /// Value stored in the input working set.
    Workset { set_id: SetId },
    /// Working set is based on a previous run and does not override this one.
    BaseRun { run_id: RunId },
    /// Imported from a run of another model.
    ImportRun { model_name: String, run_id: RunId },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalar_by_kind() {
        assert_eq!(
            ParamValues::parse_scalar(ValueKind::Int, " 1234 ").unwrap(),
            ParamValues::Int(vec![1234])
        );
        assert_eq!(
            ParamValues::parse_scalar(ValueKind::Float, "0.25").unwrap(),
            ParamValues::Float(vec![0.25])
        );
        assert_eq!(
            ParamValues::parse_scalar(ValueKind::Bool, "TRUE").unwrap(),
            ParamValues::Bool(vec![true])
        );
        assert!(ParamValues::parse_scalar(ValueKind::Int, "x1").is_err());
    }

    #[test]
    fn shape_check() {
        let v = ParamValues::Float(vec![1.0, 2.0, 3.0]);
        v.expect_shape(ValueKind::Float, 3).unwrap();
        assert!(v.expect_shape(ValueKind::Float, 2).is_err());
        assert!(v.expect_shape(ValueKind::Int, 3).is_err());
    }
}
