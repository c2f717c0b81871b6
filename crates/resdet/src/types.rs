//! Result types handed back to callers.
//!
//! These are plain owned values; nothing in them refers to engine memory.

use serde::{Deserialize, Serialize};

/// One engine estimate of the true width or height.
///
/// `index` and `confidence` are passed through untouched. A confidence of
/// `-1.0` is the engine's marker for the image's own dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub index: usize,
    pub confidence: f32,
}

impl Resolution {
    pub fn new(index: usize, confidence: f32) -> Self {
        Self { index, confidence }
    }
}

/// Width and height candidates, in engine order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolutions {
    pub widths: Vec<Resolution>,
    pub heights: Vec<Resolution>,
}

impl Resolutions {
    pub fn new(widths: Vec<Resolution>, heights: Vec<Resolution>) -> Self {
        Self { widths, heights }
    }

    /// The first width candidate, if any.
    pub fn best_width(&self) -> Option<Resolution> {
        self.widths.first().copied()
    }

    /// The first height candidate, if any.
    pub fn best_height(&self) -> Option<Resolution> {
        self.heights.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_widths_and_heights() {
        let resolutions = Resolutions::new(
            vec![Resolution::new(2, -1.0)],
            vec![Resolution::new(2, -1.0)],
        );
        let json = serde_json::to_value(&resolutions).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "widths": [{"index": 2, "confidence": -1.0}],
                "heights": [{"index": 2, "confidence": -1.0}]
            })
        );
    }

    #[test]
    fn test_best_candidates_follow_engine_order() {
        let resolutions = Resolutions::new(
            vec![Resolution::new(640, 0.9), Resolution::new(1280, -1.0)],
            Vec::new(),
        );
        assert_eq!(resolutions.best_width(), Some(Resolution::new(640, 0.9)));
        assert_eq!(resolutions.best_height(), None);
    }
}
