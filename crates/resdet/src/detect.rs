//! One-shot detection.

use tracing::debug;

use crate::engine::{Engine, Status};
use crate::error::{translate, RdError, Result};
use crate::marshal::{copy_image, OutSlots};
use crate::memory::Addr;
use crate::method::Method;
use crate::params::{NativeParameters, ParameterOverrides};
use crate::types::Resolutions;

/// Detect the true resolution of `image_count` stacked `width * height`
/// frames.
///
/// Every arena allocation made here, and both result arrays the engine hands
/// back, are released before this returns, on success and on every error.
pub fn detect<E: Engine + ?Sized>(
    engine: &E,
    pixels: &[f32],
    image_count: u32,
    width: u32,
    height: u32,
    method: Option<&Method>,
    parameters: &ParameterOverrides,
) -> Result<Resolutions> {
    let params = NativeParameters::build(engine, parameters)?;
    let required = u64::from(image_count) * u64::from(width) * u64::from(height);
    ensure_pixels(engine, pixels.len() as u64, required)?;

    let memory = engine.memory();
    let image = copy_image(memory, pixels)?;
    let slots = OutSlots::alloc(memory)?;

    let status = engine.resdetect(
        image.addr(),
        image_count,
        width,
        height,
        slots.addrs(),
        method.map_or(Addr::NULL, |m| m.handle().addr()),
        params.addr(),
    );
    params.release();
    image.release();

    let status = status?;
    if !status.is_ok() {
        drop(slots);
        debug!(status = ?status, image_count, width, height, "detection failed");
        return Err(translate(engine, status));
    }
    slots.into_resolutions()
}

/// Reject buffers of `have` pixels too short for the frames they claim to
/// hold.
pub(crate) fn ensure_pixels<E: Engine + ?Sized>(engine: &E, have: u64, required: u64) -> Result<()> {
    if have < required {
        debug!(have, required, "pixel buffer too short");
        return Err(match translate(engine, Status::INVAL) {
            err @ RdError::InvalidImage { .. } => err,
            other => RdError::InvalidImage {
                message: other.to_string(),
            },
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use crate::error::ErrorKind;
    use crate::types::Resolution;
    use pretty_assertions::assert_eq;

    const CHECKERBOARD: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

    #[test]
    fn test_checkerboard_defaults() {
        let engine = MemoryEngine::new();
        let result = detect(&engine, &CHECKERBOARD, 1, 2, 2, None, &ParameterOverrides::new())
            .unwrap();
        assert_eq!(result.widths, vec![Resolution::new(2, -1.0)]);
        assert_eq!(result.heights, vec![Resolution::new(2, -1.0)]);
        assert_eq!(engine.outstanding_allocations(), 0);
    }

    #[test]
    fn test_short_buffer_is_invalid_image() {
        let engine = MemoryEngine::new();
        let err = detect(&engine, &CHECKERBOARD, 2, 2, 2, None, &ParameterOverrides::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert_eq!(err.to_string(), "Invalid image");
        assert_eq!(engine.heap().stats().allocations, 0);
    }

    #[test]
    fn test_parameters_checked_before_buffer_length() {
        let engine = MemoryEngine::new();
        let overrides = ParameterOverrides::new().with_range(0);
        let err = detect(&engine, &CHECKERBOARD, 2, 2, 2, None, &overrides).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert_eq!(engine.outstanding_allocations(), 0);

        let overrides = ParameterOverrides::new().with_range(1);
        let err = detect(&engine, &CHECKERBOARD, 2, 2, 2, None, &overrides).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert_eq!(engine.outstanding_allocations(), 0);
        assert_eq!(engine.heap().stats().invalid_releases, 0);
    }

    #[test]
    fn test_engine_failure_releases_everything() {
        let engine = MemoryEngine::new();
        let overrides = ParameterOverrides::new().with_range(2);
        let err = detect(&engine, &CHECKERBOARD, 1, 0, 0, None, &overrides).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert_eq!(engine.outstanding_allocations(), 0);
        assert_eq!(engine.heap().stats().invalid_releases, 0);
    }
}
