//! Stateful analysis sessions.
//!
//! A session owns one engine handle from creation until it is destroyed,
//! either explicitly with [`Analysis::destroy`] or, as a backstop, when the
//! session is dropped. The handle is released exactly once by whichever runs
//! first.
//!
//! Every operation takes `&mut self`: the engine is not reentrant per
//! session, so calls on one session are sequential by construction.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::detect::ensure_pixels;
use crate::engine::{Engine, Status};
use crate::error::{check, translate, RdError, Result};
use crate::marshal::{copy_image, ImageBuffer, OutSlots};
use crate::memory::{Addr, Allocation, LinearMemory};
use crate::method::Method;
use crate::params::{NativeParameters, ParameterOverrides};
use crate::types::Resolutions;

/// An engine session accumulating evidence across images.
pub struct Analysis<E: Engine> {
    engine: Arc<E>,
    handle: Option<Addr>,
    width: u32,
    height: u32,
    images: u64,
}

impl<E: Engine> Analysis<E> {
    /// Open a session for `width * height` frames.
    ///
    /// On failure no handle exists and nothing needs destroying.
    pub fn create(
        engine: Arc<E>,
        width: u32,
        height: u32,
        method: Option<&Method>,
        parameters: &ParameterOverrides,
    ) -> Result<Self> {
        let handle = open(&*engine, width, height, method, parameters)?;
        debug!(%handle, width, height, "analysis created");
        Ok(Self {
            engine,
            handle: Some(handle),
            width,
            height,
            images: 0,
        })
    }

    /// Integrate one frame of at least `width * height` pixels.
    pub fn analyze_image(&mut self, pixels: &[f32]) -> Result<()> {
        let handle = self.live()?;
        let engine = &*self.engine;
        ensure_pixels(engine, pixels.len() as u64, self.frame_len())?;

        let image = copy_image(engine.memory(), pixels)?;
        let status = engine.analyze_image(handle, image.addr());
        image.release();
        self.accept(status?)
    }

    /// Integrate the frame currently held in `buffer`, without copying it.
    ///
    /// The buffer must live in this session's engine memory, as one from
    /// [`Resdet::image_buffer`] does. It stays owned by the caller.
    ///
    /// [`Resdet::image_buffer`]: crate::Resdet::image_buffer
    pub fn analyze_buffer(&mut self, buffer: &ImageBuffer<'_, E::Memory>) -> Result<()> {
        let handle = self.live()?;
        ensure_pixels(&*self.engine, buffer.len(), self.frame_len())?;

        let status = self.engine.analyze_image(handle, buffer.addr())?;
        self.accept(status)
    }

    /// Results over every frame analyzed so far. Repeatable.
    pub fn results(&mut self) -> Result<Resolutions> {
        let handle = self.live()?;
        let engine = &*self.engine;

        let slots = OutSlots::alloc(engine.memory())?;
        let status = engine.analysis_results(handle, slots.addrs())?;
        if !status.is_ok() {
            drop(slots);
            return Err(translate(engine, status));
        }
        slots.into_resolutions()
    }

    /// Release the engine handle. Later calls do nothing.
    pub fn destroy(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                debug!(%handle, images = self.images, "analysis destroyed");
                self.engine.destroy_analysis(handle)
            }
            None => Ok(()),
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.is_none()
    }

    /// Frames accepted by this session.
    pub fn images_analyzed(&self) -> u64 {
        self.images
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    fn frame_len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    fn accept(&mut self, status: Status) -> Result<()> {
        check(&*self.engine, status)?;
        self.images += 1;
        Ok(())
    }

    fn live(&self) -> Result<Addr> {
        self.handle.ok_or_else(|| RdError::InvalidParameter {
            status: None,
            message: "analysis has been destroyed".to_string(),
        })
    }
}

impl<E: Engine> Drop for Analysis<E> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!(%handle, "analysis dropped without destroy, reclaiming");
            if let Err(err) = self.engine.destroy_analysis(handle) {
                warn!(%handle, error = %err, "reclaiming analysis failed");
            }
        }
    }
}

impl<E: Engine> std::fmt::Debug for Analysis<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analysis")
            .field("handle", &self.handle)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("images", &self.images)
            .finish()
    }
}

/// Create the engine session and return its handle.
fn open<E: Engine>(
    engine: &E,
    width: u32,
    height: u32,
    method: Option<&Method>,
    parameters: &ParameterOverrides,
) -> Result<Addr> {
    let params = NativeParameters::build(engine, parameters)?;
    let memory = engine.memory();
    let error_slot = Allocation::scalar(memory)?;

    let handle = engine.create_analysis(
        method.map_or(Addr::NULL, |m| m.handle().addr()),
        width,
        height,
        params.addr(),
        error_slot.addr(),
    );
    params.release();
    let handle = handle?;

    let status = match memory.read_i32(error_slot.addr()) {
        Ok(code) => Status::new(code),
        Err(err) => {
            error_slot.release();
            if !handle.is_null() {
                engine.destroy_analysis(handle)?;
            }
            return Err(err.into());
        }
    };
    error_slot.release();

    if !status.is_ok() {
        if !handle.is_null() {
            engine.destroy_analysis(handle)?;
        }
        return Err(translate(engine, status));
    }
    if handle.is_null() {
        return Err(translate(engine, Status::INTERNAL));
    }
    Ok(handle)
}
