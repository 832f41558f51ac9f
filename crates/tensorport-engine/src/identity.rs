//! Loopback engine that echoes inputs to outputs.
//!
//! The "model file" is a JSON manifest declaring the session signature, so
//! smoke runs and fault-injection tests need no real model artifact.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tensorport_core::{DType, Result, Status, TensorInfo};

use crate::{EngineTensor, SessionOptions};

#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityEngine {
    serialize_loads: bool,
}

impl IdentityEngine {
    pub fn new() -> Self {
        Self {
            serialize_loads: false,
        }
    }

    /// Marks session creation as thread-unsafe, mirroring engine stacks
    /// whose loaders must never run concurrently.
    pub fn with_serialized_loads() -> Self {
        Self {
            serialize_loads: true,
        }
    }

    pub(crate) fn thread_safe_load(&self) -> bool {
        !self.serialize_loads
    }

    pub(crate) fn load(&self, path: &Path, _options: &SessionOptions) -> Result<IdentitySession> {
        let raw = std::fs::read(path).map_err(|e| {
            Status::internal(format!(
                "failed to read identity manifest '{}': {e}",
                path.display()
            ))
        })?;
        let manifest: Manifest = serde_json::from_slice(&raw).map_err(|e| {
            Status::internal(format!(
                "failed to parse identity manifest '{}': {e}",
                path.display()
            ))
        })?;

        let inputs = manifest
            .inputs
            .into_iter()
            .map(|t| (t.name, TensorInfo::new(t.data_type, t.dims)))
            .collect();
        let outputs = manifest
            .outputs
            .into_iter()
            .map(|t| (t.name, TensorInfo::new(t.data_type, t.dims)))
            .collect();

        let mut session = IdentitySession::from_signature(inputs, outputs);
        session.input_aliases = manifest.input_aliases;
        session.output_aliases = manifest.output_aliases;
        session.fail_run = manifest.fail_run;
        tracing::debug!(manifest = %path.display(), "loaded identity session");
        Ok(session)
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    inputs: Vec<ManifestTensor>,
    #[serde(default)]
    outputs: Vec<ManifestTensor>,
    /// Configured name -> session tensor name.
    #[serde(default)]
    input_aliases: HashMap<String, String>,
    #[serde(default)]
    output_aliases: HashMap<String, String>,
    /// Fault injection: every run fails with an engine error.
    #[serde(default)]
    fail_run: bool,
}

#[derive(Debug, Deserialize)]
struct ManifestTensor {
    name: String,
    data_type: DType,
    dims: Vec<i64>,
}

/// A loaded loopback session. Output `i` mirrors input `i`.
pub struct IdentitySession {
    inputs: Vec<(String, TensorInfo)>,
    outputs: Vec<(String, TensorInfo)>,
    input_aliases: HashMap<String, String>,
    output_aliases: HashMap<String, String>,
    fail_run: bool,
}

impl IdentitySession {
    /// Build a session directly from a signature, bypassing the manifest.
    pub fn from_signature(
        inputs: Vec<(String, TensorInfo)>,
        outputs: Vec<(String, TensorInfo)>,
    ) -> Self {
        Self {
            inputs,
            outputs,
            input_aliases: HashMap::new(),
            output_aliases: HashMap::new(),
            fail_run: false,
        }
    }

    pub fn fail_runs(&mut self) {
        self.fail_run = true;
    }

    pub(crate) fn input_infos(&self) -> HashMap<String, TensorInfo> {
        self.inputs.iter().cloned().collect()
    }

    pub(crate) fn output_infos(&self) -> HashMap<String, TensorInfo> {
        self.outputs.iter().cloned().collect()
    }

    pub(crate) fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|(n, _)| n.clone()).collect()
    }

    pub(crate) fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|(n, _)| n.clone()).collect()
    }

    pub(crate) fn input_name_map(&self) -> HashMap<String, String> {
        self.input_aliases.clone()
    }

    pub(crate) fn output_name_map(&self) -> HashMap<String, String> {
        self.output_aliases.clone()
    }

    pub(crate) fn run(
        &mut self,
        input_names: &[String],
        inputs: &[EngineTensor],
        output_names: &[String],
    ) -> Result<Vec<EngineTensor>> {
        if self.fail_run {
            return Err(Status::engine(1, "identity engine: injected run failure"));
        }
        if input_names.len() != inputs.len() {
            return Err(Status::internal(format!(
                "identity engine got {} input names for {} tensors",
                input_names.len(),
                inputs.len()
            )));
        }

        let mut results = Vec::with_capacity(output_names.len());
        for name in output_names {
            let position = self
                .outputs
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| {
                    Status::internal(format!("identity engine has no output tensor '{name}'"))
                })?;
            let (mirrored_name, _) = self.inputs.get(position).ok_or_else(|| {
                Status::internal(format!(
                    "identity engine has no input to mirror for output '{name}'"
                ))
            })?;
            let tensor_idx = input_names
                .iter()
                .position(|n| n == mirrored_name)
                .ok_or_else(|| {
                    Status::internal(format!(
                        "identity engine run is missing input '{mirrored_name}'"
                    ))
                })?;
            results.push(inputs[tensor_idx].clone());
        }
        Ok(results)
    }
}
