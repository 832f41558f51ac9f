//! Builds the execution-context set for one model and ties each context to
//! a scheduler runner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::info;

use tensorport_core::{
    Accelerator, ControlKind, InstanceKind, ModelConfig, Result, Status, CUDA_ACCELERATOR,
    GPU_IO_ACCELERATOR, OPENVINO_ACCELERATOR, TENSORRT_ACCELERATOR,
};
use tensorport_engine::{
    Engine, GraphOptLevel, SessionOptions, TensorRtOptions, TrtPrecision,
};

use crate::context::{DeviceSlot, ExecutionContext};
use crate::memory::DeviceStream;
use crate::payload::Payload;
use crate::scheduler::Scheduler;
use crate::validation;

/// Serializes session creation for engine stacks whose loaders are not
/// thread-safe. Held only across `Engine::load`; no run path ever takes it.
static SESSION_CREATE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Run `f`, serialized against every other thread-unsafe session creation
/// in the process when `serialize` is set.
pub fn with_session_create_lock<T>(serialize: bool, f: impl FnOnce() -> T) -> T {
    if serialize {
        let _guard = SESSION_CREATE_LOCK.lock();
        f()
    } else {
        f()
    }
}

/// A model file known to the repository loader.
#[derive(Clone, Debug)]
pub struct ModelFile {
    pub initialized: bool,
    pub path: PathBuf,
}

/// Filename -> model file, supplied by the repository loader.
pub type ModelFileMap = HashMap<String, ModelFile>;

/// Queries physical device properties.
pub trait DeviceInventory: Send + Sync {
    /// `"major.minor"` compute capability of a device.
    fn compute_capability(&self, device: i32) -> Result<String>;
}

/// Inventory for builds without GPU support.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoGpuInventory;

impl DeviceInventory for NoGpuInventory {
    fn compute_capability(&self, device: i32) -> Result<String> {
        Err(Status::unavailable(format!(
            "unable to get device properties for GPU {device}: GPU support is not compiled in"
        )))
    }
}

/// Summary of one built instance, for tooling and logs.
#[derive(Clone, Debug)]
pub struct InstanceDesc {
    pub name: String,
    pub device: DeviceSlot,
    pub max_batch_size: i32,
}

/// The built context set for one model, bound to scheduler runners.
///
/// Each context lives in its own mutex cell; runner `i` is the only thread
/// that ever locks cell `i`, so the lock satisfies ownership without
/// serializing anything.
pub struct ModelRuntime {
    name: String,
    config: Arc<ModelConfig>,
    contexts: Vec<Mutex<ExecutionContext>>,
}

impl std::fmt::Debug for ModelRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRuntime")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ModelRuntime {
    /// Build every instance-group context and register the runners.
    ///
    /// Any error aborts the whole build; contexts created so far drop
    /// cleanly.
    pub fn create(
        config: ModelConfig,
        models: &ModelFileMap,
        engine: &Engine,
        devices: &dyn DeviceInventory,
        scheduler: &mut dyn Scheduler,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let base_options = base_session_options(&config);

        let mut contexts = Vec::new();
        for group in &config.instance_group {
            for replica in 0..group.count {
                match group.kind {
                    InstanceKind::Cpu => {
                        let instance_name = format!("{}_{replica}_cpu", group.name);
                        contexts.push(create_execution_context(
                            instance_name,
                            DeviceSlot::Cpu,
                            &config,
                            models,
                            engine,
                            devices,
                            &base_options,
                        )?);
                    }
                    InstanceKind::ModelDevice => {
                        let instance_name = format!("{}_{replica}_model_device", group.name);
                        contexts.push(create_execution_context(
                            instance_name,
                            DeviceSlot::ModelDevice,
                            &config,
                            models,
                            engine,
                            devices,
                            &base_options,
                        )?);
                    }
                    InstanceKind::Gpu => {
                        for &gpu in &group.gpus {
                            let instance_name = format!("{}_{replica}_gpu{gpu}", group.name);
                            contexts.push(create_execution_context(
                                instance_name,
                                DeviceSlot::Gpu(gpu),
                                &config,
                                models,
                                engine,
                                devices,
                                &base_options,
                            )?);
                        }
                    }
                }
            }
        }

        let runtime = Arc::new(Self {
            name: config.name.clone(),
            config,
            contexts: contexts.into_iter().map(Mutex::new).collect(),
        });

        // One runner per context; runner i is exclusively tied to context i.
        let entry = Arc::clone(&runtime);
        scheduler.set_configured(
            runtime.contexts.len(),
            Box::new(|_runner_idx| Ok(())),
            Box::new(move |runner_idx, payloads| entry.run(runner_idx, payloads)),
            Box::new(|_runner_idx, _input_name, _input, _payload: &Payload| Ok(None)),
        )?;

        Ok(runtime)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn instances(&self) -> Vec<InstanceDesc> {
        self.contexts
            .iter()
            .map(|cell| {
                let context = cell.lock();
                InstanceDesc {
                    name: context.name().to_string(),
                    device: context.device(),
                    max_batch_size: context.max_batch_size(),
                }
            })
            .collect()
    }

    /// Entry point for runner `runner_idx`.
    pub fn run(&self, runner_idx: usize, payloads: &mut Vec<Payload>) -> Result<()> {
        let cell = self.contexts.get(runner_idx).ok_or_else(|| {
            Status::internal(format!(
                "invalid runner index {runner_idx} for '{}'",
                self.name
            ))
        })?;
        cell.lock().run(payloads)
    }
}

fn base_session_options(config: &ModelConfig) -> SessionOptions {
    let graph_level = match config.optimization.graph_level {
        Some(-1) => GraphOptLevel::Basic,
        Some(1) => GraphOptLevel::Extended,
        _ => GraphOptLevel::Full,
    };
    SessionOptions {
        intra_op_threads: 1,
        graph_level,
        ..SessionOptions::default()
    }
}

/// Pick the model file for a device: GPUs select by compute capability with
/// the default filename as fallback, everything else uses the default.
pub fn resolve_model_filename(
    config: &ModelConfig,
    device: DeviceSlot,
    devices: &dyn DeviceInventory,
) -> Result<String> {
    match device {
        DeviceSlot::Cpu | DeviceSlot::ModelDevice => Ok(config.default_model_filename.clone()),
        DeviceSlot::Gpu(gpu) => {
            let cc = devices.compute_capability(gpu)?;
            Ok(config
                .cc_model_filenames
                .get(&cc)
                .cloned()
                .unwrap_or_else(|| config.default_model_filename.clone()))
        }
    }
}

fn parse_integral(name: &str, value: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|_| {
        Status::invalid_arg(format!(
            "failed to convert {name} '{value}' to integral number"
        ))
    })
}

fn tensorrt_options(accelerator: &Accelerator) -> Result<TensorRtOptions> {
    let mut options = TensorRtOptions::default();
    for (key, value) in &accelerator.parameters {
        match key.as_str() {
            "precision_mode" => {
                options.precision = match value.as_str() {
                    "FP32" => TrtPrecision::Fp32,
                    "FP16" => TrtPrecision::Fp16,
                    other => {
                        return Err(Status::invalid_arg(format!(
                            "unsupported precision mode '{other}' is requested"
                        )))
                    }
                };
            }
            "minimum_segment_size" => {
                options.minimum_segment_size = parse_integral(key, value)?;
            }
            "max_workspace_size_bytes" => {
                options.max_workspace_size_bytes = parse_integral(key, value)?;
            }
            "max_cached_engines" => {
                options.max_cached_engines = parse_integral(key, value)?;
            }
            other => {
                return Err(Status::invalid_arg(format!(
                    "unknown parameter '{other}' is provided for TensorRT Execution Accelerator"
                )))
            }
        }
    }
    Ok(options)
}

/// Fold the configured execution accelerators into session options.
pub fn resolve_accelerators(
    config: &ModelConfig,
    device: DeviceSlot,
    options: &mut SessionOptions,
) -> Result<()> {
    let Some(accelerators) = &config.optimization.execution_accelerators else {
        return Ok(());
    };

    if !accelerators.gpu_execution_accelerator.is_empty() && device == DeviceSlot::Cpu {
        return Err(Status::invalid_arg(
            "GPU Execution Accelerator can only be set on a non-CPU context",
        ));
    }

    for accelerator in &accelerators.gpu_execution_accelerator {
        match accelerator.name.as_str() {
            TENSORRT_ACCELERATOR => {
                options.tensorrt = Some(tensorrt_options(accelerator)?);
            }
            CUDA_ACCELERATOR => {
                if let Some(key) = accelerator.parameters.keys().next() {
                    return Err(Status::invalid_arg(format!(
                        "unknown parameter '{key}' is provided for CUDA Execution Accelerator"
                    )));
                }
                options.cuda = true;
            }
            GPU_IO_ACCELERATOR => {
                options.gpu_io = true;
            }
            other => {
                return Err(Status::invalid_arg(format!(
                    "unknown Execution Accelerator '{other}' is requested"
                )))
            }
        }
    }

    for accelerator in &accelerators.cpu_execution_accelerator {
        match accelerator.name.as_str() {
            OPENVINO_ACCELERATOR => options.openvino = true,
            other => {
                return Err(Status::invalid_arg(format!(
                    "unknown Execution Accelerator '{other}' is requested"
                )))
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn create_execution_context(
    instance_name: String,
    device: DeviceSlot,
    config: &Arc<ModelConfig>,
    models: &ModelFileMap,
    engine: &Engine,
    devices: &dyn DeviceInventory,
    base_options: &SessionOptions,
) -> Result<ExecutionContext> {
    let filename = resolve_model_filename(config, device, devices)?;
    let Some(model_file) = models.get(&filename) else {
        return Err(Status::internal(format!(
            "unable to find model '{filename}' for '{}'",
            config.name
        )));
    };
    if !model_file.initialized {
        return Err(Status::internal(format!(
            "model file '{filename}' for '{}' is not initialized",
            config.name
        )));
    }

    info!(
        instance = %instance_name,
        device = %device,
        file = %filename,
        "creating instance"
    );

    let mut options = base_options.clone();
    if let DeviceSlot::Gpu(gpu) = device {
        options.gpu_device = Some(gpu);
    }
    resolve_accelerators(config, device, &mut options)?;

    let thread_safe = engine.session_create_is_thread_safe(&options);
    let session =
        with_session_create_lock(!thread_safe, || engine.load(&model_file.path, &options))?;

    let stream = match device {
        DeviceSlot::Gpu(gpu) => Some(DeviceStream::new(gpu)?),
        _ => None,
    };

    let input_name_map = session.input_name_map();
    let output_name_map = session.output_name_map();
    let input_infos = session.input_infos()?;

    let mut expected_input_cnt = config.input.len();
    if let Some(batching) = &config.sequence_batching {
        for kind in ControlKind::ALL {
            if validation::validate_sequence_control(
                &config.name,
                batching,
                kind,
                &input_infos,
                &input_name_map,
                config.max_batch_size,
            )? {
                expected_input_cnt += 1;
            }
        }
    }

    validation::validate_inputs(
        &config.name,
        config,
        &input_infos,
        &input_name_map,
        expected_input_cnt,
    )?;
    validation::validate_outputs(
        &config.name,
        config,
        &session.output_infos()?,
        &output_name_map,
    )?;

    Ok(ExecutionContext::new(
        instance_name,
        device,
        Arc::clone(config),
        session,
        stream,
        input_name_map,
        output_name_map,
    ))
}
