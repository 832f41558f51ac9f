//! Execution contexts: one bound (instance, device) unit owning a loaded
//! session, plus the per-batch run orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use tensorport_core::{
    DType, ModelConfig, Result, Status, MODEL_DEVICE, NO_BATCHING, NO_GPU_DEVICE,
};
use tensorport_engine::{EngineSession, EngineTensor};

use crate::io;
use crate::memory::DeviceStream;
use crate::payload::{Payload, TimestampKind};

/// Device binding of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceSlot {
    Cpu,
    Gpu(i32),
    /// Placement is encoded in the model file.
    ModelDevice,
}

impl DeviceSlot {
    /// Ordinal encoding used in logs and config interop.
    pub fn ordinal(self) -> i32 {
        match self {
            DeviceSlot::Cpu => NO_GPU_DEVICE,
            DeviceSlot::Gpu(device) => device,
            DeviceSlot::ModelDevice => MODEL_DEVICE,
        }
    }

    pub fn is_gpu(self) -> bool {
        matches!(self, DeviceSlot::Gpu(_))
    }
}

impl std::fmt::Display for DeviceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSlot::Cpu => f.write_str("cpu"),
            DeviceSlot::Gpu(device) => write!(f, "gpu{device}"),
            DeviceSlot::ModelDevice => f.write_str("model_device"),
        }
    }
}

/// Per-run engine tensors, released once on every exit path.
///
/// `release` is idempotent; it also runs on drop, so early error returns
/// cannot leak the tensors past the run.
#[derive(Default)]
pub struct RunTensors {
    inputs: Vec<EngineTensor>,
    outputs: Vec<EngineTensor>,
    released: bool,
}

impl RunTensors {
    pub fn with_inputs(inputs: Vec<EngineTensor>) -> Self {
        Self {
            inputs,
            outputs: Vec::new(),
            released: false,
        }
    }

    pub fn inputs(&self) -> &[EngineTensor] {
        &self.inputs
    }

    pub fn set_outputs(&mut self, outputs: Vec<EngineTensor>) {
        self.outputs = outputs;
    }

    pub fn outputs(&self) -> &[EngineTensor] {
        &self.outputs
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) {
        if !self.released {
            self.inputs = Vec::new();
            self.outputs = Vec::new();
            self.released = true;
        }
    }
}

impl Drop for RunTensors {
    fn drop(&mut self) {
        self.release();
    }
}

/// One bound (instance, device) unit owning a loaded session.
///
/// Immutable after construction; a context is only ever entered by the one
/// runner it is tied to, so runs never overlap.
pub struct ExecutionContext {
    name: String,
    device: DeviceSlot,
    max_batch_size: i32,
    enable_pinned_input: bool,
    enable_pinned_output: bool,
    session: EngineSession,
    stream: Option<DeviceStream>,
    /// Configured name -> session tensor name.
    input_name_map: HashMap<String, String>,
    output_name_map: HashMap<String, String>,
    config: Arc<ModelConfig>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        device: DeviceSlot,
        config: Arc<ModelConfig>,
        session: EngineSession,
        stream: Option<DeviceStream>,
        input_name_map: HashMap<String, String>,
        output_name_map: HashMap<String, String>,
    ) -> Self {
        let max_batch_size = config.max_batch_size.max(NO_BATCHING);
        Self {
            name,
            device,
            max_batch_size,
            enable_pinned_input: config.optimization.input_pinned_memory,
            enable_pinned_output: config.optimization.output_pinned_memory,
            session,
            stream,
            input_name_map,
            output_name_map,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceSlot {
        self.device
    }

    pub fn max_batch_size(&self) -> i32 {
        self.max_batch_size
    }

    pub fn session(&self) -> &EngineSession {
        &self.session
    }

    /// Execute one batch delivered by the scheduler.
    ///
    /// Per-payload problems land on the payload's status; a returned error
    /// is a batch-level failure and the scheduler stamps every payload.
    pub fn run(&mut self, payloads: &mut [Payload]) -> Result<()> {
        debug!(
            instance = %self.name,
            payloads = payloads.len(),
            "running batch"
        );

        // Payloads with failed status must not reach a runner; the batcher
        // filters them out before delivery.
        let mut total_batch_size = 0usize;
        for payload in payloads.iter() {
            if !payload.is_ok() {
                return Err(Status::internal(format!(
                    "unexpected payload with non-ok status given to runner for '{}'",
                    self.name
                )));
            }
            total_batch_size += payload.request.batch_size as usize;
        }

        if total_batch_size == 0 {
            return Ok(());
        }

        if self.max_batch_size == NO_BATCHING {
            if total_batch_size != 1 {
                return Err(Status::internal(format!(
                    "batch size {total_batch_size} for '{}', model does not support batching",
                    self.name
                )));
            }
        } else if total_batch_size > self.max_batch_size as usize {
            return Err(Status::internal(format!(
                "dynamic batch size {total_batch_size} for '{}', max allowed is {}",
                self.name, self.max_batch_size
            )));
        }

        // All payloads carry identically-shaped inputs, so any of them can
        // serve as the representative.
        let representative = Arc::clone(&payloads[0].request);

        let mut assemblies = Vec::with_capacity(representative.inputs.len());
        let mut device_copy = false;
        for (name, input) in &representative.inputs {
            let engine_name = self
                .input_name_map
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.clone());
            let assembly = io::stage_input(
                name,
                &engine_name,
                input.dtype,
                &input.dims,
                total_batch_size,
                self.max_batch_size,
                self.enable_pinned_input,
                payloads,
                self.stream.as_ref(),
            )?;
            device_copy |= assembly.device_copy();
            assemblies.push(assembly);
        }

        // String parsing and the engine need host-visible data; drain the
        // stream before going further.
        if device_copy {
            self.synchronize()?;
        }
        let mut device_copy = false;
        for assembly in &mut assemblies {
            device_copy |= assembly.apply_indirect(payloads, self.stream.as_ref())?;
        }
        if device_copy {
            self.synchronize()?;
        }

        let mut input_names = Vec::with_capacity(assemblies.len());
        let mut input_tensors = Vec::with_capacity(assemblies.len());
        for assembly in assemblies {
            let (engine_name, tensor) = assembly.into_tensor(payloads)?;
            input_names.push(engine_name);
            input_tensors.push(tensor);
        }

        for payload in payloads.iter() {
            if let Some(stats) = &payload.stats {
                stats.capture(TimestampKind::ComputeInputEnd);
            }
        }

        // Every configured output is retrieved from the engine.
        let mut output_names = Vec::with_capacity(self.config.output.len());
        for output in &self.config.output {
            let engine_name = self
                .output_name_map
                .get(&output.name)
                .cloned()
                .unwrap_or_else(|| output.name.clone());
            output_names.push(engine_name);
        }

        let mut run_tensors = RunTensors::with_inputs(input_tensors);
        let outputs = self
            .session
            .run(&input_names, run_tensors.inputs(), &output_names)?;
        run_tensors.set_outputs(outputs);

        for payload in payloads.iter() {
            if let Some(stats) = &payload.stats {
                stats.capture(TimestampKind::ComputeOutputStart);
            }
        }

        if run_tensors.outputs().len() != output_names.len() {
            return Err(Status::internal(format!(
                "expected {} output tensors for '{}', engine returned {}",
                output_names.len(),
                self.name,
                run_tensors.outputs().len()
            )));
        }

        let mut device_copy = false;
        let mut output_indirects: Vec<io::OutputIndirect> = Vec::new();
        for (idx, output) in self.config.output.iter().enumerate() {
            let tensor = &run_tensors.outputs()[idx];
            if output.data_type == DType::String {
                device_copy |= io::scatter_string_output(
                    &output.name,
                    tensor,
                    total_batch_size,
                    self.enable_pinned_output,
                    payloads,
                    self.stream.as_ref(),
                )?;
            } else {
                device_copy |= io::scatter_fixed_output(
                    &output.name,
                    tensor,
                    output.data_type,
                    total_batch_size,
                    self.enable_pinned_output,
                    payloads,
                    self.stream.as_ref(),
                    &mut output_indirects,
                )?;
            }
        }

        if device_copy {
            self.synchronize()?;
        }
        let device_copy =
            io::apply_output_indirect(&output_indirects, payloads, self.stream.as_ref())?;
        if device_copy {
            self.synchronize()?;
        }

        run_tensors.release();
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.synchronize()?;
        }
        Ok(())
    }
}
