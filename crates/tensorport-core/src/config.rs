use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::DType;

/// Accelerator names recognized under `optimization.execution_accelerators`.
pub const TENSORRT_ACCELERATOR: &str = "tensorrt";
pub const CUDA_ACCELERATOR: &str = "cuda";
pub const GPU_IO_ACCELERATOR: &str = "gpu_io";
pub const OPENVINO_ACCELERATOR: &str = "openvino";

/// Declarative configuration for one served model.
///
/// The schema is semantic-compatible with the protobuf-style config the
/// repository loader produces; here it is a plain serde data model.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    /// 0 means the model does not support batching.
    pub max_batch_size: i32,
    pub instance_group: Vec<InstanceGroup>,
    pub default_model_filename: String,
    /// Model file variant per device compute capability ("major.minor").
    pub cc_model_filenames: HashMap<String, String>,
    pub optimization: Optimization,
    pub input: Vec<ModelInput>,
    pub output: Vec<ModelOutput>,
    pub sequence_batching: Option<SequenceBatching>,
    /// Declared inputs accepted even when the loaded session does not
    /// provide a tensor of that name.
    pub allowed_input_names: Vec<String>,
    /// Same override for declared outputs.
    pub allowed_output_names: Vec<String>,
}

impl ModelConfig {
    pub fn output(&self, name: &str) -> Option<&ModelOutput> {
        self.output.iter().find(|io| io.name == name)
    }

    pub fn input(&self, name: &str) -> Option<&ModelInput> {
        self.input.iter().find(|io| io.name == name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceGroup {
    pub name: String,
    pub kind: InstanceKind,
    pub count: u32,
    /// Device ordinals, only meaningful for `Gpu` groups.
    pub gpus: Vec<i32>,
}

impl Default for InstanceGroup {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: InstanceKind::Cpu,
            count: 1,
            gpus: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    #[default]
    Cpu,
    Gpu,
    /// Placement is encoded in the model file itself.
    ModelDevice,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInput {
    pub name: String,
    pub data_type: DType,
    /// Declared dims, without the batch axis.
    pub dims: Vec<i64>,
    /// When present, replaces `dims` for signature comparison.
    #[serde(default)]
    pub reshape: Option<Vec<i64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelOutput {
    pub name: String,
    pub data_type: DType,
    pub dims: Vec<i64>,
    #[serde(default)]
    pub reshape: Option<Vec<i64>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Optimization {
    /// Graph optimization level: unset = highest, -1 = basic, 1 = extended.
    pub graph_level: Option<i32>,
    pub input_pinned_memory: bool,
    pub output_pinned_memory: bool,
    pub execution_accelerators: Option<ExecutionAccelerators>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionAccelerators {
    pub gpu_execution_accelerator: Vec<Accelerator>,
    pub cpu_execution_accelerator: Vec<Accelerator>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Accelerator {
    pub name: String,
    pub parameters: HashMap<String, String>,
}

/// Sequence-model control tensors the sequence batcher materializes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceBatching {
    pub control_input: Vec<ControlInput>,
}

impl SequenceBatching {
    pub fn control(&self, kind: ControlKind) -> Option<&ControlInput> {
        self.control_input.iter().find(|c| c.kind == kind)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlInput {
    /// Tensor name the control is delivered through.
    pub name: String,
    pub kind: ControlKind,
    pub data_type: DType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    SequenceStart,
    SequenceEnd,
    SequenceReady,
    SequenceCorrid,
}

impl ControlKind {
    pub const ALL: [ControlKind; 4] = [
        ControlKind::SequenceStart,
        ControlKind::SequenceEnd,
        ControlKind::SequenceReady,
        ControlKind::SequenceCorrid,
    ];

    /// The corrid control carries a typed id; the rest are boolean flags.
    pub fn is_typed(self) -> bool {
        self == ControlKind::SequenceCorrid
    }
}
