//! In-process engine for tests.
//!
//! Lives entirely inside a [`HeapArena`]: the method table, parameter objects,
//! session handles and result arrays are all arena allocations, laid out the
//! way libresdet lays them out on wasm32. Scoring is a plain edge-periodicity
//! count, enough to make parameters change candidate sets deterministically.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::{Engine, ResultSlots, Status};
use crate::error::{RdError, Result};
use crate::marshal::{METHOD_STRIDE, METHOD_THRESHOLD_OFFSET, RESOLUTION_STRIDE};
use crate::memory::{Addr, HeapArena, HeapConfig, LinearMemory, MemoryError};

/// Search range used when a parameter object does not override it.
pub const DEFAULT_RANGE: u32 = 12;

/// Size of a parameter object: range, threshold, compression filter.
const PARAMS_SIZE: u32 = 12;
const PARAMS_THRESHOLD_OFFSET: u32 = 4;
const PARAMS_FILTER_OFFSET: u32 = 8;

/// Size of the block backing a session handle.
const ANALYSIS_HANDLE_SIZE: u32 = 16;

/// Largest frame, in pixels, a session or detection will accept.
const MAX_PIXELS: u64 = (u32::MAX / 4) as u64;

struct MethodDef {
    name: &'static str,
    threshold: f32,
    /// Effective range is always 1
    zero_crossing: bool,
}

const METHODS: [MethodDef; 4] = [
    MethodDef { name: "sign", threshold: 0.55, zero_crossing: false },
    MethodDef { name: "mag", threshold: 0.40, zero_crossing: false },
    MethodDef { name: "orig", threshold: 0.64, zero_crossing: false },
    MethodDef { name: "zerox", threshold: 0.30, zero_crossing: true },
];

/// Effective settings for one detection or session.
#[derive(Debug, Clone, Copy)]
struct Settings {
    range: u32,
    threshold: f32,
    compression_filter: u32,
}

/// Per-axis evidence accumulated over submitted frames.
struct Evidence {
    width: u32,
    height: u32,
    settings: Settings,
    images: u32,
    columns: Vec<f32>,
    rows: Vec<f32>,
}

impl Evidence {
    fn new(width: u32, height: u32, settings: Settings) -> Self {
        Self {
            width,
            height,
            settings,
            images: 0,
            columns: vec![0.0; width as usize],
            rows: vec![0.0; height as usize],
        }
    }

    fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Integrate one frame. Non-finite pixels reject the whole frame.
    fn accumulate(&mut self, frame: &[f32]) -> Status {
        if frame.iter().any(|p| !p.is_finite()) {
            return Status::INVAL;
        }
        let (w, h) = (self.width as usize, self.height as usize);

        for x in 1..w {
            let steps = (0..h).filter(|y| frame[y * w + x] != frame[y * w + x - 1]).count();
            self.columns[x] += steps as f32 / h as f32;
        }
        for y in 1..h {
            let steps = (0..w).filter(|x| frame[y * w + x] != frame[(y - 1) * w + x]).count();
            self.rows[y] += steps as f32 / w as f32;
        }

        self.images += 1;
        Status::OK
    }
}

#[derive(Default)]
struct EngineState {
    /// Method table base, laid out on first use
    table: Option<Addr>,
    static_allocations: usize,
    analyses: HashMap<u32, Evidence>,
    destroyed: u64,
    invalid_destroys: u64,
}

/// An [`Engine`] backed by an in-process [`HeapArena`].
pub struct MemoryEngine {
    heap: HeapArena,
    state: Mutex<EngineState>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Create an engine over an arena with default limits.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Create an engine over an arena with custom limits.
    pub fn with_config(config: HeapConfig) -> Self {
        Self {
            heap: HeapArena::with_config(config),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// The arena every engine call operates in.
    pub fn heap(&self) -> &HeapArena {
        &self.heap
    }

    /// Arena allocations still live, excluding the engine's static data.
    pub fn outstanding_allocations(&self) -> usize {
        let statics = self.state.lock().static_allocations;
        self.heap.live_allocations().saturating_sub(statics)
    }

    /// Sessions created and not yet destroyed.
    pub fn live_analyses(&self) -> usize {
        self.state.lock().analyses.len()
    }

    /// Successful destroy calls.
    pub fn destroyed_analyses(&self) -> u64 {
        self.state.lock().destroyed
    }

    /// Destroy calls on handles that were not live.
    pub fn invalid_destroys(&self) -> u64 {
        self.state.lock().invalid_destroys
    }

    fn table(&self) -> Result<Addr> {
        let mut state = self.state.lock();
        if let Some(table) = state.table {
            return Ok(table);
        }

        let size = METHOD_STRIDE * (METHODS.len() as u32 + 1);
        let table = self.heap.alloc(size).ok_or_else(RdError::out_of_memory)?;
        let mut allocated = 1;

        for (i, def) in METHODS.iter().enumerate() {
            let record = table.offset(METHOD_STRIDE * i as u32)?;
            let name = [def.name.as_bytes(), &[0]].concat();
            let Some(string) = self.heap.alloc(name.len() as u32) else {
                // unwind the partial layout
                for j in 0..i {
                    let record = table.offset(METHOD_STRIDE * j as u32)?;
                    self.heap.free(self.heap.read_addr(record)?);
                }
                self.heap.free(table);
                return Err(RdError::out_of_memory());
            };
            allocated += 1;
            self.heap.write(string, &name)?;
            self.heap.write_addr(record, string)?;
            self.heap
                .write_f32(record.offset(METHOD_THRESHOLD_OFFSET)?, def.threshold)?;
        }

        debug!(%table, methods = METHODS.len(), "method table laid out");
        state.table = Some(table);
        state.static_allocations = allocated;
        Ok(table)
    }

    /// Index into [`METHODS`] for a record address; `None` for foreign addresses.
    fn method_index(&self, method: Addr) -> Option<usize> {
        let table = self.state.lock().table?;
        let delta = method.get().checked_sub(table.get())?;
        let index = (delta / METHOD_STRIDE) as usize;
        (delta % METHOD_STRIDE == 0 && index < METHODS.len()).then_some(index)
    }

    /// Resolve effective settings, or the status that rejects them.
    fn configure(
        &self,
        method: Addr,
        width: u32,
        height: u32,
        params: Addr,
    ) -> Result<std::result::Result<Settings, Status>> {
        let def = if method.is_null() {
            &METHODS[0]
        } else {
            match self.method_index(method) {
                Some(index) => &METHODS[index],
                None => return Ok(Err(Status::PARAM)),
            }
        };

        let mut settings = if params.is_null() {
            Settings {
                range: DEFAULT_RANGE,
                threshold: -1.0,
                compression_filter: 0,
            }
        } else {
            Settings {
                range: self.heap.read_u32(params)?,
                threshold: self.heap.read_f32(params.offset(PARAMS_THRESHOLD_OFFSET)?)?,
                compression_filter: self.heap.read_u32(params.offset(PARAMS_FILTER_OFFSET)?)?,
            }
        };

        if settings.threshold < 0.0 {
            settings.threshold = def.threshold;
        }
        if def.zero_crossing {
            settings.range = 1;
        }

        if width == 0 || height == 0 {
            return Ok(Err(Status::INVAL));
        }
        if u64::from(width) * u64::from(height) > MAX_PIXELS {
            return Ok(Err(Status::TOOBIG));
        }
        Ok(Ok(settings))
    }

    /// Allocate and fill one engine-owned result array. `None` on exhaustion.
    fn publish(
        &self,
        length: u32,
        sums: &[f32],
        images: u32,
        settings: Settings,
    ) -> Result<Option<(Addr, u32)>> {
        let mut candidates = vec![(length, -1.0f32)];

        let period = match settings.compression_filter {
            0 => 0,
            filter => length.saturating_mul(2) / filter,
        };
        let end = length.saturating_sub(settings.range);
        for x in settings.range.max(1)..end {
            if period > 0 && x % period == 0 {
                continue;
            }
            let score = sums[x as usize] / images as f32;
            if score >= settings.threshold {
                candidates.push((x, score));
            }
        }

        let count = candidates.len() as u32;
        let Some(array) = self.heap.alloc(count * RESOLUTION_STRIDE) else {
            return Ok(None);
        };
        for (i, (index, confidence)) in candidates.into_iter().enumerate() {
            let record = array.offset(RESOLUTION_STRIDE * i as u32)?;
            self.heap.write_u32(record, index)?;
            self.heap.write_f32(record.offset(4)?, confidence)?;
        }
        Ok(Some((array, count)))
    }

    /// Zero every non-null out-parameter. PARAM when an array slot has no
    /// matching count slot.
    fn reset_slots(&self, slots: ResultSlots) -> Result<Status> {
        for addr in [slots.widths, slots.heights] {
            if !addr.is_null() {
                self.heap.write_addr(addr, Addr::NULL)?;
            }
        }
        for addr in [slots.width_count, slots.height_count] {
            if !addr.is_null() {
                self.heap.write_u32(addr, 0)?;
            }
        }
        let unpaired = (!slots.widths.is_null() && slots.width_count.is_null())
            || (!slots.heights.is_null() && slots.height_count.is_null());
        Ok(if unpaired { Status::PARAM } else { Status::OK })
    }

    /// Publish both axes of `evidence` into `slots`.
    fn write_results(&self, evidence: &Evidence, slots: ResultSlots) -> Result<Status> {
        if evidence.images == 0 {
            return Ok(Status::NOIMG);
        }

        let mut published = Vec::with_capacity(2);
        let axes = [
            (slots.widths, slots.width_count, evidence.width, &evidence.columns),
            (slots.heights, slots.height_count, evidence.height, &evidence.rows),
        ];
        for (array_slot, count_slot, length, sums) in axes {
            if array_slot.is_null() {
                continue;
            }
            match self.publish(length, sums, evidence.images, evidence.settings)? {
                Some((array, count)) => {
                    published.push(array);
                    self.heap.write_addr(array_slot, array)?;
                    self.heap.write_u32(count_slot, count)?;
                }
                None => {
                    for array in published {
                        self.heap.free(array);
                    }
                    self.reset_slots(slots)?;
                    return Ok(Status::NOMEM);
                }
            }
        }
        Ok(Status::OK)
    }

    fn read_frame(&self, image: Addr, index: u32, pixels: usize) -> Result<Vec<f32>> {
        let stride = pixels as u64 * 4;
        let offset = u32::try_from(stride * u64::from(index))
            .map_err(|_| MemoryError::Overflow(image))?;
        Ok(self.heap.read_f32_slice(image.offset(offset)?, pixels)?)
    }
}

impl Engine for MemoryEngine {
    type Memory = HeapArena;

    fn memory(&self) -> &HeapArena {
        &self.heap
    }

    fn lib_version(&self) -> Result<String> {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    fn default_range(&self) -> Result<u32> {
        Ok(DEFAULT_RANGE)
    }

    fn error_str(&self, status: Status) -> Result<Option<String>> {
        let message = match status {
            Status::OK => "",
            Status::NOMEM => "Out of memory",
            Status::INTERNAL => "Internal error",
            Status::INVAL => "Invalid image",
            Status::UNSUPP => "Unsupported image file format",
            Status::TOOBIG => "Image size exceeds limit",
            Status::PARAM => "Parameter missing or invalid",
            Status::NOIMG => "No images were analyzed",
            other => {
                return Ok(other
                    .errno()
                    .map(|errno| std::io::Error::from_raw_os_error(errno).to_string()))
            }
        };
        Ok(Some(message.to_string()))
    }

    fn methods(&self) -> Result<Addr> {
        self.table()
    }

    fn get_method(&self, name: &str) -> Result<Addr> {
        let table = self.table()?;
        match METHODS.iter().position(|def| def.name == name) {
            Some(index) => Ok(table.offset(METHOD_STRIDE * index as u32)?),
            None => Ok(Addr::NULL),
        }
    }

    fn alloc_default_parameters(&self) -> Result<Addr> {
        let Some(params) = self.heap.alloc(PARAMS_SIZE) else {
            return Ok(Addr::NULL);
        };
        self.heap.write_u32(params, DEFAULT_RANGE)?;
        self.heap.write_f32(params.offset(PARAMS_THRESHOLD_OFFSET)?, -1.0)?;
        self.heap.write_u32(params.offset(PARAMS_FILTER_OFFSET)?, 0)?;
        Ok(params)
    }

    fn parameters_set_range(&self, params: Addr, range: u32) -> Result<Status> {
        if params.is_null() || range == 0 {
            return Ok(Status::PARAM);
        }
        self.heap.write_u32(params, range)?;
        Ok(Status::OK)
    }

    fn parameters_set_threshold(&self, params: Addr, threshold: f32) -> Result<Status> {
        if params.is_null() || !(0.0..=1.0).contains(&threshold) {
            return Ok(Status::PARAM);
        }
        self.heap
            .write_f32(params.offset(PARAMS_THRESHOLD_OFFSET)?, threshold)?;
        Ok(Status::OK)
    }

    fn parameters_set_compression_filter(&self, params: Addr, filter: u32) -> Result<Status> {
        if params.is_null() {
            return Ok(Status::PARAM);
        }
        self.heap.write_u32(params.offset(PARAMS_FILTER_OFFSET)?, filter)?;
        Ok(Status::OK)
    }

    #[allow(clippy::too_many_arguments)]
    fn resdetect(
        &self,
        image: Addr,
        image_count: u32,
        width: u32,
        height: u32,
        slots: ResultSlots,
        method: Addr,
        params: Addr,
    ) -> Result<Status> {
        let status = self.reset_slots(slots)?;
        if !status.is_ok() {
            return Ok(status);
        }
        if image.is_null() {
            return Ok(Status::PARAM);
        }
        if image_count == 0 {
            return Ok(Status::NOIMG);
        }
        let settings = match self.configure(method, width, height, params)? {
            Ok(settings) => settings,
            Err(status) => return Ok(status),
        };
        if u64::from(width) * u64::from(height) * u64::from(image_count) > MAX_PIXELS {
            return Ok(Status::TOOBIG);
        }

        let mut evidence = Evidence::new(width, height, settings);
        for i in 0..image_count {
            let frame = self.read_frame(image, i, evidence.pixels())?;
            let status = evidence.accumulate(&frame);
            if !status.is_ok() {
                return Ok(status);
            }
        }

        debug!(image_count, width, height, "detection complete");
        self.write_results(&evidence, slots)
    }

    fn create_analysis(
        &self,
        method: Addr,
        width: u32,
        height: u32,
        params: Addr,
        error_out: Addr,
    ) -> Result<Addr> {
        let outcome = match self.configure(method, width, height, params)? {
            Err(status) => Err(status),
            Ok(settings) => match self.heap.alloc(ANALYSIS_HANDLE_SIZE) {
                Some(handle) => Ok((handle, settings)),
                None => Err(Status::NOMEM),
            },
        };

        let (handle, status) = match outcome {
            Ok((handle, settings)) => {
                self.state
                    .lock()
                    .analyses
                    .insert(handle.get(), Evidence::new(width, height, settings));
                debug!(%handle, width, height, "analysis created");
                (handle, Status::OK)
            }
            Err(status) => (Addr::NULL, status),
        };

        if !error_out.is_null() {
            self.heap.write_i32(error_out, status.code())?;
        }
        Ok(handle)
    }

    fn analyze_image(&self, analysis: Addr, image: Addr) -> Result<Status> {
        if analysis.is_null() || image.is_null() {
            return Ok(Status::PARAM);
        }
        let pixels = match self.state.lock().analyses.get(&analysis.get()) {
            Some(evidence) => evidence.pixels(),
            None => return Ok(Status::PARAM),
        };
        let frame = self.read_frame(image, 0, pixels)?;

        let mut state = self.state.lock();
        match state.analyses.get_mut(&analysis.get()) {
            Some(evidence) => Ok(evidence.accumulate(&frame)),
            None => Ok(Status::PARAM),
        }
    }

    fn analysis_results(&self, analysis: Addr, slots: ResultSlots) -> Result<Status> {
        let status = self.reset_slots(slots)?;
        if !status.is_ok() {
            return Ok(status);
        }
        let state = self.state.lock();
        match state.analyses.get(&analysis.get()) {
            Some(evidence) => self.write_results(evidence, slots),
            None => Ok(Status::PARAM),
        }
    }

    fn destroy_analysis(&self, analysis: Addr) -> Result<()> {
        if analysis.is_null() {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.analyses.remove(&analysis.get()).is_some() {
            state.destroyed += 1;
            drop(state);
            self.heap.free(analysis);
            debug!(handle = %analysis, "analysis destroyed");
        } else {
            state.invalid_destroys += 1;
            warn!(handle = %analysis, "destroy of an analysis that is not live");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(engine: &MemoryEngine, pixels: &[f32]) -> Addr {
        let addr = engine.heap().alloc(pixels.len() as u32 * 4).unwrap();
        engine.heap().write_f32_slice(addr, pixels).unwrap();
        addr
    }

    fn slots(engine: &MemoryEngine) -> ResultSlots {
        let heap = engine.heap();
        ResultSlots {
            widths: heap.alloc(4).unwrap(),
            width_count: heap.alloc(4).unwrap(),
            heights: heap.alloc(4).unwrap(),
            height_count: heap.alloc(4).unwrap(),
        }
    }

    #[test]
    fn test_method_table_layout() {
        let engine = MemoryEngine::new();
        let table = engine.methods().unwrap();
        let heap = engine.heap();
        for (i, def) in METHODS.iter().enumerate() {
            let record = table.offset(METHOD_STRIDE * i as u32).unwrap();
            assert_eq!(heap.read_cstr(heap.read_addr(record).unwrap()).unwrap(), def.name);
        }
        let sentinel = table.offset(METHOD_STRIDE * 4).unwrap();
        assert!(heap.read_addr(sentinel).unwrap().is_null());
        assert_eq!(engine.outstanding_allocations(), 0);
    }

    #[test]
    fn test_get_method_unknown_is_null() {
        let engine = MemoryEngine::new();
        assert!(engine.get_method("bogus").unwrap().is_null());
        assert_eq!(
            engine.get_method("mag").unwrap(),
            engine.methods().unwrap().offset(METHOD_STRIDE).unwrap()
        );
    }

    #[test]
    fn test_parameter_domain_checks() {
        let engine = MemoryEngine::new();
        let params = engine.alloc_default_parameters().unwrap();
        assert_eq!(engine.parameters_set_range(params, 0).unwrap(), Status::PARAM);
        assert_eq!(engine.parameters_set_range(params, 4).unwrap(), Status::OK);
        assert_eq!(engine.parameters_set_threshold(params, 1.5).unwrap(), Status::PARAM);
        assert_eq!(engine.parameters_set_threshold(params, f32::NAN).unwrap(), Status::PARAM);
        assert_eq!(engine.parameters_set_threshold(params, 0.0).unwrap(), Status::OK);
        assert_eq!(
            engine.parameters_set_range(Addr::NULL, 4).unwrap(),
            Status::PARAM
        );
        engine.heap().free(params);
    }

    #[test]
    fn test_resdetect_statuses() {
        let engine = MemoryEngine::new();
        let image = write_image(&engine, &[1.0, 0.0, 0.0, 1.0]);
        let out = slots(&engine);

        let status = engine
            .resdetect(image, 1, 0, 0, out, Addr::NULL, Addr::NULL)
            .unwrap();
        assert_eq!(status, Status::INVAL);

        let status = engine
            .resdetect(image, 0, 2, 2, out, Addr::NULL, Addr::NULL)
            .unwrap();
        assert_eq!(status, Status::NOIMG);

        let nan = write_image(&engine, &[f32::NAN, 0.0, 0.0, 1.0]);
        let status = engine.resdetect(nan, 1, 2, 2, out, Addr::NULL, Addr::NULL).unwrap();
        assert_eq!(status, Status::INVAL);
        assert!(engine.heap().read_addr(out.widths).unwrap().is_null());
    }

    #[test]
    fn test_resdetect_publishes_own_dimension_first() {
        let engine = MemoryEngine::new();
        let image = write_image(&engine, &[1.0, 0.0, 0.0, 1.0]);
        let out = slots(&engine);
        let status = engine
            .resdetect(image, 1, 2, 2, out, Addr::NULL, Addr::NULL)
            .unwrap();
        assert_eq!(status, Status::OK);

        let heap = engine.heap();
        let widths = heap.read_addr(out.widths).unwrap();
        assert_eq!(heap.read_u32(out.width_count).unwrap(), 1);
        assert_eq!(heap.read_u32(widths).unwrap(), 2);
        assert_eq!(heap.read_f32(widths.offset(4).unwrap()).unwrap(), -1.0);
    }

    #[test]
    fn test_unpaired_slot_is_param() {
        let engine = MemoryEngine::new();
        let image = write_image(&engine, &[1.0, 0.0, 0.0, 1.0]);
        let mut out = slots(&engine);
        out.width_count = Addr::NULL;
        let status = engine
            .resdetect(image, 1, 2, 2, out, Addr::NULL, Addr::NULL)
            .unwrap();
        assert_eq!(status, Status::PARAM);
    }

    #[test]
    fn test_create_analysis_writes_status() {
        let engine = MemoryEngine::new();
        let error_out = engine.heap().alloc(4).unwrap();

        let handle = engine
            .create_analysis(Addr::NULL, 0, 0, Addr::NULL, error_out)
            .unwrap();
        assert!(handle.is_null());
        assert_eq!(engine.heap().read_i32(error_out).unwrap(), Status::INVAL.code());

        let handle = engine
            .create_analysis(Addr::NULL, 2, 2, Addr::NULL, error_out)
            .unwrap();
        assert!(!handle.is_null());
        assert_eq!(engine.heap().read_i32(error_out).unwrap(), 0);
        assert_eq!(engine.live_analyses(), 1);
    }

    #[test]
    fn test_analysis_results_before_feed_is_noimg() {
        let engine = MemoryEngine::new();
        let handle = engine
            .create_analysis(Addr::NULL, 2, 2, Addr::NULL, Addr::NULL)
            .unwrap();
        let out = slots(&engine);
        assert_eq!(engine.analysis_results(handle, out).unwrap(), Status::NOIMG);
        assert_eq!(engine.analysis_results(Addr::new(8), out).unwrap(), Status::PARAM);
    }

    #[test]
    fn test_destroy_counts() {
        let engine = MemoryEngine::new();
        let handle = engine
            .create_analysis(Addr::NULL, 2, 2, Addr::NULL, Addr::NULL)
            .unwrap();
        engine.destroy_analysis(handle).unwrap();
        engine.destroy_analysis(handle).unwrap();
        engine.destroy_analysis(Addr::NULL).unwrap();
        assert_eq!(engine.destroyed_analyses(), 1);
        assert_eq!(engine.invalid_destroys(), 1);
        assert_eq!(engine.live_analyses(), 0);
        assert_eq!(engine.heap().stats().invalid_releases, 0);
    }

    #[test]
    fn test_error_strings() {
        let engine = MemoryEngine::new();
        assert_eq!(
            engine.error_str(Status::PARAM).unwrap().as_deref(),
            Some("Parameter missing or invalid")
        );
        assert_eq!(engine.error_str(Status::new(99)).unwrap(), None);
        assert!(engine.error_str(Status::new(-2)).unwrap().is_some());
    }
}
