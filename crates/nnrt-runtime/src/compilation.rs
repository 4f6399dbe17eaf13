//! Turning a frozen graph into a prepared model on one device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use nnrt_core::{
    check_config, Device, DeviceId, DimRange, ErrorKind, InputDimOverride, IntermediateGraph,
    ModelConfig, NnrtError, NnrtResult, PerformanceMode, PreparedModel, Priority, SerializedModel,
};
use tracing::{debug, info, warn};

use crate::cache::ModelCache;
use crate::device_manager::DeviceManager;
use crate::extension::Extensions;
use crate::identity::hardware_hash;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompilationOptions {
    pub device: Option<DeviceId>,
    pub cache_dir: Option<PathBuf>,
    pub cache_version: u64,
    /// Prefix of every cache file name.
    pub model_name: Option<String>,
    pub performance: PerformanceMode,
    pub priority: Priority,
    pub float16: bool,
    pub profiling: bool,
    pub shared_feature_map: bool,
    pub input_dims: Vec<InputDimOverride>,
}

impl CompilationOptions {
    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            float16: self.float16,
            performance: self.performance,
            priority: self.priority,
            profiling: self.profiling,
            shared_feature_map: self.shared_feature_map,
            input_dims: self.input_dims.clone(),
        }
    }
}

pub(crate) struct Built {
    pub device: Arc<dyn Device>,
    pub prepared: Box<dyn PreparedModel>,
    pub ranges: Option<Vec<Vec<DimRange>>>,
    pub from_cache: bool,
}

/// Configured until `build` succeeds, built afterwards.
pub struct Compilation {
    graph: IntermediateGraph,
    options: CompilationOptions,
    manager: Arc<DeviceManager>,
    built: Option<Built>,
}

impl Compilation {
    pub fn new(graph: IntermediateGraph) -> NnrtResult<Self> {
        Self::with_device_manager(graph, DeviceManager::global())
    }

    pub fn with_device_manager(
        graph: IntermediateGraph,
        manager: Arc<DeviceManager>,
    ) -> NnrtResult<Self> {
        if !graph.is_frozen() {
            return Err(NnrtError::forbidden("only a frozen graph can be compiled"));
        }
        Ok(Self {
            graph,
            options: CompilationOptions::default(),
            manager,
            built: None,
        })
    }

    pub fn graph(&self) -> &IntermediateGraph {
        &self.graph
    }

    pub fn options(&self) -> &CompilationOptions {
        &self.options
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    /// Whether the prepared model came from the on-disk cache.
    pub fn built_from_cache(&self) -> bool {
        self.built.as_ref().is_some_and(|built| built.from_cache)
    }

    fn configurable(&mut self, what: &str) -> NnrtResult<&mut CompilationOptions> {
        if self.built.is_some() {
            return Err(NnrtError::forbidden(format!(
                "cannot set {what} after the compilation was built"
            )));
        }
        Ok(&mut self.options)
    }

    pub fn set_device(&mut self, device: DeviceId) -> NnrtResult<()> {
        self.configurable("the device")?.device = Some(device);
        Ok(())
    }

    pub fn set_cache(&mut self, dir: impl Into<PathBuf>, version: u64) -> NnrtResult<()> {
        let options = self.configurable("the cache")?;
        options.cache_dir = Some(dir.into());
        options.cache_version = version;
        Ok(())
    }

    pub fn set_performance_mode(&mut self, mode: PerformanceMode) -> NnrtResult<()> {
        self.configurable("the performance mode")?.performance = mode;
        Ok(())
    }

    pub fn set_priority(&mut self, priority: Priority) -> NnrtResult<()> {
        self.configurable("the priority")?.priority = priority;
        Ok(())
    }

    pub fn set_float16(&mut self, enable: bool) -> NnrtResult<()> {
        self.configurable("float16")?.float16 = enable;
        Ok(())
    }

    /// Folds parsed extensions into the options; absent keys keep
    /// their current values.
    pub fn apply_extensions(&mut self, extensions: &Extensions) -> NnrtResult<()> {
        if self.built.is_some() {
            return Err(NnrtError::forbidden(
                "cannot apply extensions after the compilation was built",
            ));
        }
        for dims in &extensions.input_dims {
            self.check_override(dims)?;
        }
        let options = &mut self.options;
        if let Some(path) = &extensions.cache_path {
            options.cache_dir = Some(path.clone());
        }
        if let Some(name) = &extensions.model_name {
            options.model_name = Some(name.clone());
        }
        if let Some(profiling) = extensions.profiling {
            options.profiling = profiling;
        }
        if let Some(shared) = extensions.shared_feature_map {
            options.shared_feature_map = shared;
        }
        if !extensions.input_dims.is_empty() {
            options.input_dims = extensions.input_dims.clone();
        }
        Ok(())
    }

    fn check_override(&self, dims: &InputDimOverride) -> NnrtResult<()> {
        let inputs = self.graph.input_tensors()?;
        let desc = inputs.get(dims.input).ok_or_else(|| {
            NnrtError::invalid_argument(format!(
                "input dims given for input {}, graph has {} inputs",
                dims.input,
                inputs.len()
            ))
        })?;
        if desc.shape.rank() != dims.dims.len() {
            return Err(NnrtError::invalid_argument(format!(
                "input {} has rank {}, override gives {} dims",
                dims.input,
                desc.shape.rank(),
                dims.dims.len()
            )));
        }
        for (declared, given) in desc.shape.dims().iter().zip(&dims.dims) {
            if let (Some(declared), Some(given)) = (declared, given) {
                if declared != given {
                    return Err(NnrtError::invalid_argument(format!(
                        "input {}: static dimension {declared} cannot be overridden with {given}",
                        dims.input
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolves the device and prepares the model, from the cache when
    /// a valid one exists. A second call after success does nothing.
    pub fn build(&mut self) -> NnrtResult<()> {
        if self.built.is_some() {
            debug!("compilation already built");
            return Ok(());
        }
        let id = self
            .options
            .device
            .ok_or_else(|| NnrtError::forbidden("no device selected for compilation"))?;
        let device = self.manager.device(id)?;
        let config = self.options.model_config();
        self.check_capabilities(device.as_ref(), &config)?;

        let started = Instant::now();
        let cache = self.model_cache();
        let mut from_cache = false;
        let mut prepared = None;
        if let Some(cache) = &cache {
            match self.prepare_cached(cache, device.as_ref(), &config) {
                Ok(model) => {
                    from_cache = true;
                    prepared = Some(model);
                }
                Err(err) if err.kind() == ErrorKind::InvalidArgument => return Err(err),
                Err(err) => debug!(%err, "model cache miss"),
            }
        }
        let prepared = match prepared {
            Some(prepared) => prepared,
            None => {
                let prepared = self.prepare_fresh(device.as_ref(), &config)?;
                if let Some(cache) = &cache {
                    let buffers = prepared.export_cache()?;
                    cache.store(self.options.cache_version, &buffers)?;
                }
                prepared
            }
        };

        let ranges = prepared.input_dim_ranges()?;
        info!(
            device = %device.info().name,
            from_cache,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compilation built"
        );
        self.built = Some(Built {
            device,
            prepared,
            ranges,
            from_cache,
        });
        Ok(())
    }

    fn check_capabilities(&self, device: &dyn Device, config: &ModelConfig) -> NnrtResult<()> {
        let caps = device.capabilities();
        check_config(&caps, config)?;
        if self.options.cache_dir.is_some() && !caps.model_cache {
            return Err(NnrtError::forbidden("device does not support model caching"));
        }
        if !caps.dynamic_input && self.graph.input_tensors()?.iter().any(|d| d.shape.has_dynamic())
        {
            return Err(NnrtError::forbidden(
                "device does not support inputs with dynamic dimensions",
            ));
        }
        Ok(())
    }

    fn model_cache(&self) -> Option<ModelCache> {
        let dir = self.options.cache_dir.as_ref()?;
        let token = self.options.model_name.clone().unwrap_or_default();
        Some(ModelCache::new(dir.clone(), token, hardware_hash()))
    }

    fn prepare_cached(
        &self,
        cache: &ModelCache,
        device: &dyn Device,
        config: &ModelConfig,
    ) -> NnrtResult<Box<dyn PreparedModel>> {
        let info = cache.validate(self.options.cache_version)?;
        let buffers = cache.load(&info)?;
        debug!(files = buffers.len(), "model cache hit");
        device.prepare_from_cache(&buffers, config)
    }

    fn prepare_fresh(
        &self,
        device: &dyn Device,
        config: &ModelConfig,
    ) -> NnrtResult<Box<dyn PreparedModel>> {
        let model = device.serialize(&self.graph)?;
        let prepared = device.prepare_model(&model, config);
        let SerializedModel { constants, .. } = model;
        if let Some(constants) = constants {
            if let Err(err) = device.release_buffer(constants) {
                warn!(%err, "failed to release serialized constants");
            }
        }
        prepared
    }

    pub(crate) fn built(&self) -> NnrtResult<&Built> {
        self.built
            .as_ref()
            .ok_or_else(|| NnrtError::forbidden("compilation has not been built"))
    }

    pub fn device(&self) -> NnrtResult<Arc<dyn Device>> {
        Ok(Arc::clone(&self.built()?.device))
    }

    /// Per input, per dimension bounds the prepared model accepts; `None`
    /// when the driver does not report them.
    pub fn input_dim_ranges(&self) -> NnrtResult<Option<&[Vec<DimRange>]>> {
        Ok(self.built()?.ranges.as_deref())
    }
}
