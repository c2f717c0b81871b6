//! wasmtime-backed engine.
//!
//! All store access goes through one mutex, so the guest sees strictly
//! sequential calls no matter how many sessions share the engine.

use parking_lot::Mutex;
use resdet::{Addr, Allocation, Engine, LinearMemory, MemoryError, RdError, ResultSlots, Status};
use tracing::{debug, warn};
use wasmtime::{
    Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, TypedFunc,
    WasmParams, WasmResults,
};

use crate::config::WasmConfig;
use crate::error::{Result, WasmError};

type Slots = (u32, u32, u32, u32);

/// The guest's typed exports.
struct Exports {
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    error_str: TypedFunc<i32, u32>,
    methods: TypedFunc<(), u32>,
    get_method: TypedFunc<u32, u32>,
    alloc_default_parameters: TypedFunc<(), u32>,
    set_range: TypedFunc<(u32, u32), i32>,
    set_threshold: TypedFunc<(u32, f32), i32>,
    set_compression_filter: TypedFunc<(u32, u32), i32>,
    #[allow(clippy::type_complexity)]
    resdetect: TypedFunc<(u32, u32, u32, u32, u32, u32, u32, u32, u32, u32), i32>,
    create_analysis: TypedFunc<(u32, u32, u32, u32, u32), u32>,
    analyze_image: TypedFunc<(u32, u32), i32>,
    analysis_results: TypedFunc<(u32, u32, u32, u32, u32), i32>,
    destroy_analysis: TypedFunc<u32, ()>,
    libversion: TypedFunc<(), u32>,
    default_range: TypedFunc<(), u32>,
}

impl Exports {
    fn resolve(instance: &Instance, store: &mut Store<StoreLimits>) -> Result<Self> {
        Ok(Self {
            malloc: typed(instance, store, "malloc")?,
            free: typed(instance, store, "free")?,
            error_str: typed(instance, store, "resdet_error_str")?,
            methods: typed(instance, store, "resdet_methods")?,
            get_method: typed(instance, store, "resdet_get_method")?,
            alloc_default_parameters: typed(instance, store, "resdet_alloc_default_parameters")?,
            set_range: typed(instance, store, "resdet_parameters_set_range")?,
            set_threshold: typed(instance, store, "resdet_parameters_set_threshold")?,
            set_compression_filter: typed(
                instance,
                store,
                "resdet_parameters_set_compression_filter",
            )?,
            resdetect: typed(instance, store, "resdetect")?,
            create_analysis: typed(instance, store, "resdet_create_analysis")?,
            analyze_image: typed(instance, store, "resdet_analyze_image")?,
            analysis_results: typed(instance, store, "resdet_analysis_results")?,
            destroy_analysis: typed(instance, store, "resdet_destroy_analysis")?,
            libversion: typed(instance, store, "resdet_libversion")?,
            default_range: typed(instance, store, "resdet_default_range")?,
        })
    }
}

fn typed<P: WasmParams, R: WasmResults>(
    instance: &Instance,
    store: &mut Store<StoreLimits>,
    name: &'static str,
) -> Result<TypedFunc<P, R>> {
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| WasmError::MissingExport(name, format!("{e:#}")))
}

struct Guest {
    store: Store<StoreLimits>,
    memory: Memory,
    exports: Exports,
}

/// A libresdet guest instance.
pub struct WasmEngine {
    guest: Mutex<Guest>,
}

impl WasmEngine {
    /// Read, compile and instantiate the module named by `config`.
    pub fn load(config: &WasmConfig) -> Result<Self> {
        let bytes = std::fs::read(&config.module).map_err(|source| WasmError::Io {
            path: config.module.display().to_string(),
            source,
        })?;
        Self::from_bytes(&bytes, config)
    }

    /// Compile and instantiate a module from memory. `config.module` is
    /// not read.
    pub fn from_bytes(bytes: &[u8], config: &WasmConfig) -> Result<Self> {
        let engine = wasmtime::Engine::default();
        let module =
            Module::new(&engine, bytes).map_err(|e| WasmError::Compile(format!("{e:#}")))?;

        let mut limits = StoreLimitsBuilder::new();
        if let Some(max) = config.max_memory_bytes {
            limits = limits.memory_size(max);
        }
        let mut store = Store::new(&engine, limits.build());
        store.limiter(|limits| limits);

        let mut linker = Linker::new(&engine);
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(|e| WasmError::Instantiate(format!("{e:#}")))?;
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| WasmError::Instantiate(format!("{e:#}")))?;

        if let Some(name) = &config.initializer {
            if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, name) {
                init.call(&mut store, ())
                    .map_err(|e| WasmError::Instantiate(format!("{name}: {e:#}")))?;
                debug!(initializer = %name, "guest initialized");
            }
        }

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(WasmError::MissingMemory)?;
        let exports = Exports::resolve(&instance, &mut store)?;

        debug!(
            memory_bytes = memory.data_size(&store),
            max_memory_bytes = ?config.max_memory_bytes,
            "guest instantiated"
        );
        Ok(Self {
            guest: Mutex::new(Guest {
                store,
                memory,
                exports,
            }),
        })
    }

    /// Current size of the guest's linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        let guest = self.guest.lock();
        guest.memory.data_size(&guest.store)
    }

    fn call<P, R>(
        &self,
        name: &'static str,
        select: impl FnOnce(&Exports) -> &TypedFunc<P, R>,
        params: P,
    ) -> resdet::Result<R>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let mut guard = self.guest.lock();
        let guest = &mut *guard;
        select(&guest.exports)
            .call(&mut guest.store, params)
            .map_err(|e| RdError::Host(format!("{name}: {e:#}")))
    }

    fn call_status<P: WasmParams>(
        &self,
        name: &'static str,
        select: impl FnOnce(&Exports) -> &TypedFunc<P, i32>,
        params: P,
    ) -> resdet::Result<Status> {
        self.call(name, select, params).map(Status::new)
    }

    fn slots(slots: ResultSlots) -> Slots {
        (
            slots.widths.get(),
            slots.width_count.get(),
            slots.heights.get(),
            slots.height_count.get(),
        )
    }
}

impl LinearMemory for WasmEngine {
    fn alloc(&self, size: u32) -> Option<Addr> {
        match self.call("malloc", |e| &e.malloc, size) {
            Ok(0) => None,
            Ok(addr) => Some(Addr::new(addr)),
            Err(err) => {
                warn!(size, error = %err, "guest malloc failed");
                None
            }
        }
    }

    fn free(&self, addr: Addr) {
        if addr.is_null() {
            return;
        }
        if let Err(err) = self.call("free", |e| &e.free, addr.get()) {
            warn!(%addr, error = %err, "guest free failed");
        }
    }

    fn read(&self, addr: Addr, buf: &mut [u8]) -> std::result::Result<(), MemoryError> {
        if addr.is_null() {
            return Err(MemoryError::Null);
        }
        let guest = self.guest.lock();
        guest
            .memory
            .read(&guest.store, addr.get() as usize, buf)
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: buf.len(),
                size: guest.memory.data_size(&guest.store),
            })
    }

    fn write(&self, addr: Addr, bytes: &[u8]) -> std::result::Result<(), MemoryError> {
        if addr.is_null() {
            return Err(MemoryError::Null);
        }
        let mut guard = self.guest.lock();
        let guest = &mut *guard;
        guest
            .memory
            .write(&mut guest.store, addr.get() as usize, bytes)
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: bytes.len(),
                size: guest.memory.data_size(&guest.store),
            })
    }
}

impl Engine for WasmEngine {
    type Memory = Self;

    fn memory(&self) -> &Self {
        self
    }

    fn lib_version(&self) -> resdet::Result<String> {
        let ptr = self.call("resdet_libversion", |e| &e.libversion, ())?;
        Ok(self.read_cstr(Addr::new(ptr))?)
    }

    fn default_range(&self) -> resdet::Result<u32> {
        self.call("resdet_default_range", |e| &e.default_range, ())
    }

    fn error_str(&self, status: Status) -> resdet::Result<Option<String>> {
        let ptr = Addr::new(self.call("resdet_error_str", |e| &e.error_str, status.code())?);
        if ptr.is_null() {
            return Ok(None);
        }
        Ok(Some(self.read_cstr(ptr)?))
    }

    fn methods(&self) -> resdet::Result<Addr> {
        self.call("resdet_methods", |e| &e.methods, ()).map(Addr::new)
    }

    fn get_method(&self, name: &str) -> resdet::Result<Addr> {
        let bytes = [name.as_bytes(), &[0]].concat();
        let size = u32::try_from(bytes.len()).map_err(|_| RdError::out_of_memory())?;
        let string = Allocation::new(self, size)?;
        self.write(string.addr(), &bytes)?;

        let record = self.call("resdet_get_method", |e| &e.get_method, string.addr().get())?;
        Ok(Addr::new(record))
    }

    fn alloc_default_parameters(&self) -> resdet::Result<Addr> {
        self.call(
            "resdet_alloc_default_parameters",
            |e| &e.alloc_default_parameters,
            (),
        )
        .map(Addr::new)
    }

    fn parameters_set_range(&self, params: Addr, range: u32) -> resdet::Result<Status> {
        self.call_status(
            "resdet_parameters_set_range",
            |e| &e.set_range,
            (params.get(), range),
        )
    }

    fn parameters_set_threshold(&self, params: Addr, threshold: f32) -> resdet::Result<Status> {
        self.call_status(
            "resdet_parameters_set_threshold",
            |e| &e.set_threshold,
            (params.get(), threshold),
        )
    }

    fn parameters_set_compression_filter(
        &self,
        params: Addr,
        filter: u32,
    ) -> resdet::Result<Status> {
        self.call_status(
            "resdet_parameters_set_compression_filter",
            |e| &e.set_compression_filter,
            (params.get(), filter),
        )
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
    ) -> resdet::Result<Status> {
        let (rw, cw, rh, ch) = Self::slots(slots);
        self.call_status(
            "resdetect",
            |e| &e.resdetect,
            (
                image.get(),
                image_count,
                width,
                height,
                rw,
                cw,
                rh,
                ch,
                method.get(),
                params.get(),
            ),
        )
    }

    fn create_analysis(
        &self,
        method: Addr,
        width: u32,
        height: u32,
        params: Addr,
        error_out: Addr,
    ) -> resdet::Result<Addr> {
        self.call(
            "resdet_create_analysis",
            |e| &e.create_analysis,
            (method.get(), width, height, params.get(), error_out.get()),
        )
        .map(Addr::new)
    }

    fn analyze_image(&self, analysis: Addr, image: Addr) -> resdet::Result<Status> {
        self.call_status(
            "resdet_analyze_image",
            |e| &e.analyze_image,
            (analysis.get(), image.get()),
        )
    }

    fn analysis_results(&self, analysis: Addr, slots: ResultSlots) -> resdet::Result<Status> {
        let (rw, cw, rh, ch) = Self::slots(slots);
        self.call_status(
            "resdet_analysis_results",
            |e| &e.analysis_results,
            (analysis.get(), rw, cw, rh, ch),
        )
    }

    fn destroy_analysis(&self, analysis: Addr) -> resdet::Result<()> {
        self.call(
            "resdet_destroy_analysis",
            |e| &e.destroy_analysis,
            analysis.get(),
        )
    }
}
