//! The `Resdet` facade.

use std::sync::Arc;

use crate::analysis::Analysis;
use crate::detect;
use crate::engine::Engine;
#[cfg(any(test, feature = "testing"))]
use crate::engine::MemoryEngine;
use crate::error::Result;
use crate::marshal::ImageBuffer;
use crate::method::{self, Method};
use crate::params::ParameterOverrides;
use crate::types::Resolutions;

/// Entry point over a shared engine.
///
/// Cloning is cheap; clones share the engine.
pub struct Resdet<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> Clone for Resdet<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl Resdet<MemoryEngine> {
    /// A binding over a fresh in-process engine.
    pub fn in_memory() -> Self {
        Self::new(MemoryEngine::new())
    }
}

impl<E: Engine> Resdet<E> {
    pub fn new(engine: E) -> Self {
        Self::from_shared(Arc::new(engine))
    }

    pub fn from_shared(engine: Arc<E>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Engine version string.
    pub fn version(&self) -> Result<String> {
        self.engine.lib_version()
    }

    /// Search range the engine uses when none is given.
    pub fn default_range(&self) -> Result<u32> {
        self.engine.default_range()
    }

    /// Every method, in engine order.
    pub fn methods(&self) -> Result<Vec<Method>> {
        method::list_methods(&*self.engine)
    }

    /// The method called exactly `name`, or `None`.
    pub fn get_method(&self, name: &str) -> Result<Option<Method>> {
        method::get_method(&*self.engine, name)
    }

    /// One-shot detection over `image_count` stacked frames.
    ///
    /// `method` of `None` lets the engine choose its default.
    pub fn detect(
        &self,
        pixels: &[f32],
        image_count: u32,
        width: u32,
        height: u32,
        method: Option<&Method>,
        parameters: &ParameterOverrides,
    ) -> Result<Resolutions> {
        detect::detect(
            &*self.engine,
            pixels,
            image_count,
            width,
            height,
            method,
            parameters,
        )
    }

    /// A reusable frame buffer in engine memory, for
    /// [`Analysis::analyze_buffer`].
    pub fn image_buffer(&self, width: u32, height: u32) -> Result<ImageBuffer<'_, E::Memory>> {
        ImageBuffer::with_dimensions(self.engine.memory(), width, height)
    }

    /// Open a session for `width * height` frames.
    pub fn analysis(
        &self,
        width: u32,
        height: u32,
        method: Option<&Method>,
        parameters: &ParameterOverrides,
    ) -> Result<Analysis<E>> {
        Analysis::create(Arc::clone(&self.engine), width, height, method, parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_and_default_range() {
        let resdet = Resdet::in_memory();
        assert_eq!(resdet.version().unwrap(), env!("CARGO_PKG_VERSION"));
        assert_eq!(resdet.default_range().unwrap(), 12);
    }

    #[test]
    fn test_clones_share_engine() {
        let resdet = Resdet::in_memory();
        let other = resdet.clone();
        drop(other.analysis(2, 2, None, &ParameterOverrides::new()).unwrap());
        assert_eq!(resdet.engine().destroyed_analyses(), 1);
    }
}
