//! Engine adapters: a fixed set of compute engines behind one capability
//! surface (load, introspect, run).
//!
//! Polymorphism is a tagged enum over concrete adapter values rather than a
//! trait hierarchy; the execution context owns one session by value and
//! dispatches by match.

use std::collections::HashMap;
use std::path::Path;

use tensorport_core::{Result, TensorInfo};

pub mod identity;
#[cfg(feature = "ort")]
pub mod ort;
#[cfg(feature = "plan")]
pub mod plan;
pub mod tensor;

pub use identity::{IdentityEngine, IdentitySession};
#[cfg(feature = "ort")]
pub use self::ort::{OrtEngine, OrtSession};
#[cfg(feature = "plan")]
pub use plan::{PlanEngine, PlanSession};
pub use tensor::EngineTensor;

/// Graph optimization level requested at session creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GraphOptLevel {
    Basic,
    Extended,
    #[default]
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrtPrecision {
    Fp32,
    Fp16,
}

/// TensorRT accelerator parameters, with the conventional defaults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorRtOptions {
    pub precision: TrtPrecision,
    pub minimum_segment_size: i64,
    pub max_workspace_size_bytes: i64,
    pub max_cached_engines: i64,
}

impl Default for TensorRtOptions {
    fn default() -> Self {
        Self {
            precision: TrtPrecision::Fp32,
            minimum_segment_size: 3,
            max_workspace_size_bytes: 1 << 30,
            max_cached_engines: 100,
        }
    }
}

/// Options resolved by the context-set builder and applied by an adapter at
/// session creation.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub intra_op_threads: u32,
    pub graph_level: GraphOptLevel,
    /// Device ordinal for GPU-bound contexts.
    pub gpu_device: Option<i32>,
    pub tensorrt: Option<TensorRtOptions>,
    pub cuda: bool,
    /// Keep tensors on the device for input/output transfers.
    pub gpu_io: bool,
    pub openvino: bool,
}

/// Compute engines compiled into the serving core.
#[derive(Clone, Debug)]
pub enum Engine {
    Identity(IdentityEngine),
    #[cfg(feature = "plan")]
    Plan(PlanEngine),
    #[cfg(feature = "ort")]
    Ort(OrtEngine),
}

impl Engine {
    pub fn name(&self) -> &'static str {
        match self {
            Engine::Identity(_) => "identity",
            #[cfg(feature = "plan")]
            Engine::Plan(_) => "plan",
            #[cfg(feature = "ort")]
            Engine::Ort(_) => "onnxruntime",
        }
    }

    /// Whether sessions may be created concurrently with these options.
    ///
    /// The builder serializes creation across the whole process when this
    /// returns false.
    pub fn session_create_is_thread_safe(&self, options: &SessionOptions) -> bool {
        match self {
            Engine::Identity(engine) => engine.thread_safe_load(),
            #[cfg(feature = "plan")]
            Engine::Plan(_) => true,
            // OpenVINO session creation is not thread-safe.
            #[cfg(feature = "ort")]
            Engine::Ort(_) => !options.openvino,
        }
    }

    pub fn load(&self, path: &Path, options: &SessionOptions) -> Result<EngineSession> {
        match self {
            Engine::Identity(engine) => engine.load(path, options).map(EngineSession::Identity),
            #[cfg(feature = "plan")]
            Engine::Plan(engine) => engine.load(path, options).map(EngineSession::Plan),
            #[cfg(feature = "ort")]
            Engine::Ort(engine) => engine.load(path, options).map(EngineSession::Ort),
        }
    }
}

/// A loaded session owned by one execution context.
pub enum EngineSession {
    Identity(IdentitySession),
    #[cfg(feature = "plan")]
    Plan(PlanSession),
    #[cfg(feature = "ort")]
    Ort(OrtSession),
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            EngineSession::Identity(_) => "Identity",
            #[cfg(feature = "plan")]
            EngineSession::Plan(_) => "Plan",
            #[cfg(feature = "ort")]
            EngineSession::Ort(_) => "Ort",
        };
        f.debug_tuple(variant).finish()
    }
}

impl EngineSession {
    pub fn input_names(&self) -> Vec<String> {
        match self {
            EngineSession::Identity(s) => s.input_names(),
            #[cfg(feature = "plan")]
            EngineSession::Plan(s) => s.input_names(),
            #[cfg(feature = "ort")]
            EngineSession::Ort(s) => s.input_names(),
        }
    }

    pub fn output_names(&self) -> Vec<String> {
        match self {
            EngineSession::Identity(s) => s.output_names(),
            #[cfg(feature = "plan")]
            EngineSession::Plan(s) => s.output_names(),
            #[cfg(feature = "ort")]
            EngineSession::Ort(s) => s.output_names(),
        }
    }

    pub fn input_infos(&self) -> Result<HashMap<String, TensorInfo>> {
        match self {
            EngineSession::Identity(s) => Ok(s.input_infos()),
            #[cfg(feature = "plan")]
            EngineSession::Plan(s) => Ok(s.input_infos()),
            #[cfg(feature = "ort")]
            EngineSession::Ort(s) => Ok(s.input_infos()),
        }
    }

    pub fn output_infos(&self) -> Result<HashMap<String, TensorInfo>> {
        match self {
            EngineSession::Identity(s) => Ok(s.output_infos()),
            #[cfg(feature = "plan")]
            EngineSession::Plan(s) => Ok(s.output_infos()),
            #[cfg(feature = "ort")]
            EngineSession::Ort(s) => Ok(s.output_infos()),
        }
    }

    /// Configured name -> session tensor name, when the session uses
    /// internal names that differ from the configured ones.
    pub fn input_name_map(&self) -> HashMap<String, String> {
        match self {
            EngineSession::Identity(s) => s.input_name_map(),
            #[cfg(feature = "plan")]
            EngineSession::Plan(_) => HashMap::new(),
            #[cfg(feature = "ort")]
            EngineSession::Ort(_) => HashMap::new(),
        }
    }

    pub fn output_name_map(&self) -> HashMap<String, String> {
        match self {
            EngineSession::Identity(s) => s.output_name_map(),
            #[cfg(feature = "plan")]
            EngineSession::Plan(_) => HashMap::new(),
            #[cfg(feature = "ort")]
            EngineSession::Ort(_) => HashMap::new(),
        }
    }

    /// Blocking inference; the result order matches `output_names`.
    pub fn run(
        &mut self,
        input_names: &[String],
        inputs: &[EngineTensor],
        output_names: &[String],
    ) -> Result<Vec<EngineTensor>> {
        match self {
            EngineSession::Identity(s) => s.run(input_names, inputs, output_names),
            #[cfg(feature = "plan")]
            EngineSession::Plan(s) => s.run(input_names, inputs, output_names),
            #[cfg(feature = "ort")]
            EngineSession::Ort(s) => s.run(input_names, inputs, output_names),
        }
    }
}
