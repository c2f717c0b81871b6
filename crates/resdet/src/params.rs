//! Sparse parameter overrides and their native parameter object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::engine::{Engine, Status};
use crate::error::{translate, RdError, Result};
use crate::memory::{Addr, Allocation, LinearMemory};

const RANGE: &str = "range";
const THRESHOLD: &str = "threshold";
const COMPRESSION_FILTER: &str = "compression_filter";

/// Option names accepted by [`ParameterOverrides::from_json`].
pub const RECOGNIZED_OPTIONS: [&str; 3] = [RANGE, THRESHOLD, COMPRESSION_FILTER];

/// Engine tuning values layered over the engine's defaults.
///
/// Each field is independently present or absent. With every field absent no
/// parameter object is created at all, which the engine reads differently
/// from an object holding zeroes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_filter: Option<u32>,
}

impl ParameterOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range: u32) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_compression_filter(mut self, filter: u32) -> Self {
        self.compression_filter = Some(filter);
        self
    }

    /// True when the engine defaults apply untouched.
    pub fn is_empty(&self) -> bool {
        self.range.is_none() && self.threshold.is_none() && self.compression_filter.is_none()
    }

    /// Parse a JSON object of overrides.
    pub fn from_json(input: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(input).map_err(|e| invalid(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Build overrides from a JSON value. `null` means no overrides.
    ///
    /// Unrecognized keys are reported first, all of them, in input order.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => return Err(invalid("parameters must be an object")),
        };

        let unrecognized: Vec<String> = map
            .keys()
            .filter(|key| !RECOGNIZED_OPTIONS.contains(&key.as_str()))
            .cloned()
            .collect();
        if !unrecognized.is_empty() {
            return Err(RdError::UnrecognizedOption { keys: unrecognized });
        }

        Ok(Self {
            range: unsigned(map.get(RANGE), RANGE)?,
            threshold: match map.get(THRESHOLD) {
                None | Some(Value::Null) => None,
                Some(value) => Some(
                    value
                        .as_f64()
                        .ok_or_else(|| invalid("threshold must be a number"))?
                        as f32,
                ),
            },
            compression_filter: unsigned(map.get(COMPRESSION_FILTER), COMPRESSION_FILTER)?,
        })
    }
}

fn unsigned(value: Option<&Value>, key: &str) -> Result<Option<u32>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| invalid(format!("{key} must be an unsigned integer"))),
    }
}

/// Run the setters for present fields, stopping at the first rejection.
fn apply<E: Engine + ?Sized>(engine: &E, params: Addr, overrides: &ParameterOverrides) -> Result<Status> {
    if let Some(range) = overrides.range {
        let status = engine.parameters_set_range(params, range)?;
        if !status.is_ok() {
            return Ok(status);
        }
    }
    if let Some(threshold) = overrides.threshold {
        let status = engine.parameters_set_threshold(params, threshold)?;
        if !status.is_ok() {
            return Ok(status);
        }
    }
    if let Some(filter) = overrides.compression_filter {
        return engine.parameters_set_compression_filter(params, filter);
    }
    Ok(Status::OK)
}

fn invalid(message: impl Into<String>) -> RdError {
    RdError::InvalidParameter {
        status: None,
        message: message.into(),
    }
}

/// A native parameter object, or none at all.
///
/// Owned by the call that built it and released when dropped.
#[derive(Debug)]
pub struct NativeParameters<'m, M: LinearMemory + ?Sized> {
    object: Option<Allocation<'m, M>>,
}

impl<'m, M: LinearMemory + ?Sized> NativeParameters<'m, M> {
    /// Marshal `overrides`. Empty overrides allocate nothing.
    ///
    /// Setters run in a fixed order (range, threshold, compression filter).
    /// The first rejected value releases the object before its error is
    /// returned.
    pub fn build<E>(engine: &'m E, overrides: &ParameterOverrides) -> Result<Self>
    where
        E: Engine<Memory = M> + ?Sized,
    {
        if overrides.is_empty() {
            return Ok(Self { object: None });
        }

        let addr = engine.alloc_default_parameters()?;
        if addr.is_null() {
            return Err(RdError::out_of_memory());
        }
        let object = Allocation::adopt(engine.memory(), addr);

        let status = apply(engine, addr, overrides)?;
        if !status.is_ok() {
            object.release();
            debug!(status = status.code(), "parameter rejected");
            return Err(translate(engine, status));
        }

        debug!(%addr, ?overrides, "parameters built");
        Ok(Self {
            object: Some(object),
        })
    }

    /// The object's address, or NULL for engine defaults.
    pub fn addr(&self) -> Addr {
        self.object.as_ref().map_or(Addr::NULL, Allocation::addr)
    }

    pub fn release(self) {
        drop(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_overrides_allocate_nothing() {
        let engine = MemoryEngine::new();
        let params = NativeParameters::build(&engine, &ParameterOverrides::new()).unwrap();
        assert!(params.addr().is_null());
        assert_eq!(engine.heap().stats().allocations, 0);
    }

    #[test]
    fn test_overrides_are_written() {
        let engine = MemoryEngine::new();
        let overrides = ParameterOverrides::new()
            .with_range(3)
            .with_threshold(0.25)
            .with_compression_filter(8);
        let params = NativeParameters::build(&engine, &overrides).unwrap();
        let heap = engine.heap();
        assert_eq!(heap.read_u32(params.addr()).unwrap(), 3);
        assert_eq!(heap.read_f32(params.addr().offset(4).unwrap()).unwrap(), 0.25);
        assert_eq!(heap.read_u32(params.addr().offset(8).unwrap()).unwrap(), 8);

        params.release();
        assert_eq!(engine.outstanding_allocations(), 0);
    }

    #[test]
    fn test_rejected_value_releases_object() {
        let engine = MemoryEngine::new();
        let overrides = ParameterOverrides::new().with_range(4).with_threshold(2.0);
        let err = NativeParameters::build(&engine, &overrides).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(err.to_string(), "Parameter missing or invalid");
        assert_eq!(engine.outstanding_allocations(), 0);
        assert_eq!(engine.heap().stats().invalid_releases, 0);
    }

    #[test]
    fn test_allocation_failure_is_out_of_memory() {
        let engine = MemoryEngine::new();
        engine.heap().fail_allocations_after(Some(0));
        let err = NativeParameters::build(&engine, &ParameterOverrides::new().with_range(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_from_json_reports_unrecognized_keys_in_order() {
        let err = ParameterOverrides::from_json(r#"{"zeta": 1, "range": 2, "alpha": true}"#)
            .unwrap_err();
        assert_eq!(
            err,
            RdError::UnrecognizedOption {
                keys: vec!["zeta".to_string(), "alpha".to_string()]
            }
        );
        assert_eq!(err.to_string(), "Unrecognized parameters: zeta,alpha");
    }

    #[test]
    fn test_unrecognized_checked_before_types() {
        let err = ParameterOverrides::from_json(r#"{"range": "wide", "unrecognized": 1}"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnrecognizedOption);
    }

    #[test]
    fn test_from_json_values() {
        let overrides =
            ParameterOverrides::from_json(r#"{"threshold": 0, "range": 1, "compression_filter": null}"#)
                .unwrap();
        assert_eq!(
            overrides,
            ParameterOverrides::new().with_range(1).with_threshold(0.0)
        );
        assert!(ParameterOverrides::from_json("null").unwrap().is_empty());
    }

    #[test]
    fn test_from_json_type_errors() {
        for input in [r#"{"range": -1}"#, r#"{"range": 1.5}"#, r#"{"threshold": "x"}"#, "[1]"] {
            let err = ParameterOverrides::from_json(input).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameter, "{input}");
        }
    }

    #[test]
    fn test_serializes_present_fields_only() {
        let overrides = ParameterOverrides::new().with_range(2);
        assert_eq!(
            serde_json::to_value(overrides).unwrap(),
            serde_json::json!({"range": 2})
        );
    }
}
