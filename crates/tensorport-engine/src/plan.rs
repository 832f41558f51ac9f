//! Graph-executor adapter over tract's typed ONNX graphs.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use tract_onnx::prelude::*;

use tensorport_core::{DType, Result, Status, TensorInfo};

use crate::{EngineTensor, GraphOptLevel, SessionOptions};

/// A runnable, optimized execution plan over a typed graph.
pub(crate) type PlanModel =
    SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Clone, Copy, Debug, Default)]
pub struct PlanEngine;

impl PlanEngine {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn load(&self, path: &Path, options: &SessionOptions) -> Result<PlanSession> {
        if options.gpu_device.is_some() {
            return Err(Status::unavailable(
                "plan engine supports CPU instances only",
            ));
        }
        if options.tensorrt.is_some() || options.cuda {
            return Err(Status::invalid_arg(
                "GPU execution accelerators are not supported by the plan engine",
            ));
        }
        if options.openvino {
            return Err(Status::invalid_arg(
                "OpenVINO execution accelerator is not supported by the plan engine",
            ));
        }

        let inference = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| load_err(path, &e))?;

        // The configured graph level maps onto tract's typing, declutter and
        // optimize stages.
        let model = match options.graph_level {
            GraphOptLevel::Basic => inference.into_typed().map_err(|e| load_err(path, &e))?,
            GraphOptLevel::Extended => inference
                .into_typed()
                .and_then(|m| m.into_decluttered())
                .map_err(|e| load_err(path, &e))?,
            GraphOptLevel::Full => inference.into_optimized().map_err(|e| load_err(path, &e))?,
        };

        let plan = model
            .into_runnable()
            .map_err(|e| load_err(path, &e))?;

        let inputs = io_signature(plan.model(), plan.model().input_outlets().map_err(tract_err)?)?;
        let outputs =
            io_signature(plan.model(), plan.model().output_outlets().map_err(tract_err)?)?;

        tracing::debug!(
            model = %path.display(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            "loaded plan session"
        );
        Ok(PlanSession {
            plan,
            inputs,
            outputs,
        })
    }
}

pub struct PlanSession {
    plan: PlanModel,
    inputs: Vec<(String, TensorInfo)>,
    outputs: Vec<(String, TensorInfo)>,
}

impl PlanSession {
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

    pub(crate) fn run(
        &mut self,
        input_names: &[String],
        inputs: &[EngineTensor],
        output_names: &[String],
    ) -> Result<Vec<EngineTensor>> {
        // The plan wants inputs in graph order regardless of delivery order.
        let mut ordered: TVec<TValue> = tvec!();
        for (session_name, _) in &self.inputs {
            let idx = input_names
                .iter()
                .position(|n| n == session_name)
                .ok_or_else(|| {
                    Status::internal(format!("plan engine run is missing input '{session_name}'"))
                })?;
            ordered.push(to_tract_value(&inputs[idx])?);
        }

        let results = self
            .plan
            .run(ordered)
            .map_err(|e| Status::engine(0, e.to_string()))?;

        let mut out = Vec::with_capacity(output_names.len());
        for name in output_names {
            let position = self
                .outputs
                .iter()
                .position(|(n, _)| n == name)
                .ok_or_else(|| {
                    Status::internal(format!("plan engine has no output tensor '{name}'"))
                })?;
            out.push(from_tract_value(&results[position])?);
        }
        Ok(out)
    }
}

fn load_err(path: &Path, err: &TractError) -> Status {
    Status::internal(format!(
        "failed to load plan model '{}': {err}",
        path.display()
    ))
}

fn tract_err(err: TractError) -> Status {
    Status::internal(err.to_string())
}

fn io_signature(
    model: &Graph<TypedFact, Box<dyn TypedOp>>,
    outlets: &[OutletId],
) -> Result<Vec<(String, TensorInfo)>> {
    let mut signature = Vec::with_capacity(outlets.len());
    for outlet in outlets {
        let fact = model.outlet_fact(*outlet).map_err(tract_err)?;
        let name = model
            .outlet_label(*outlet)
            .map(|s| s.to_string())
            .unwrap_or_else(|| model.node(outlet.node).name.clone());
        let dims = fact
            .shape
            .iter()
            .map(|dim| dim.to_i64().unwrap_or(-1))
            .collect();
        signature.push((name, TensorInfo::new(dtype_from_tract(fact.datum_type)?, dims)));
    }
    Ok(signature)
}

fn dtype_from_tract(datum: DatumType) -> Result<DType> {
    match datum {
        DatumType::Bool => Ok(DType::Bool),
        DatumType::U8 => Ok(DType::U8),
        DatumType::U16 => Ok(DType::U16),
        DatumType::I8 => Ok(DType::I8),
        DatumType::I16 => Ok(DType::I16),
        DatumType::I32 => Ok(DType::I32),
        DatumType::I64 => Ok(DType::I64),
        DatumType::F32 => Ok(DType::F32),
        DatumType::F64 => Ok(DType::F64),
        other => Err(Status::internal(format!(
            "unsupported tensor element type {other:?} reported by the plan engine"
        ))),
    }
}

fn concrete_shape(dims: &[i64]) -> Result<Vec<usize>> {
    dims.iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                Status::internal(format!(
                    "plan engine cannot run with unresolved shape {}",
                    tensorport_core::dims_to_string(dims)
                ))
            })
        })
        .collect()
}

fn to_tract_value(tensor: &EngineTensor) -> Result<TValue> {
    let shape = concrete_shape(tensor.dims())?;
    let bytes = tensor.data()?;

    let value = match tensor.dtype() {
        DType::Bool => {
            let data: Vec<bool> = bytes.iter().map(|&b| b != 0).collect();
            Tensor::from_shape(&shape, &data).map_err(tract_err)?
        }
        DType::U8 => Tensor::from_shape(&shape, &bytes.to_vec()).map_err(tract_err)?,
        DType::I8 => {
            let data: Vec<i8> = bytes.iter().map(|&b| b as i8).collect();
            Tensor::from_shape(&shape, &data).map_err(tract_err)?
        }
        DType::U16 => {
            Tensor::from_shape(&shape, &le_chunks(bytes, u16::from_le_bytes)?).map_err(tract_err)?
        }
        DType::I16 => {
            Tensor::from_shape(&shape, &le_chunks(bytes, i16::from_le_bytes)?).map_err(tract_err)?
        }
        DType::I32 => {
            Tensor::from_shape(&shape, &le_chunks(bytes, i32::from_le_bytes)?).map_err(tract_err)?
        }
        DType::I64 => {
            Tensor::from_shape(&shape, &le_chunks(bytes, i64::from_le_bytes)?).map_err(tract_err)?
        }
        DType::F32 => {
            Tensor::from_shape(&shape, &le_chunks(bytes, f32::from_le_bytes)?).map_err(tract_err)?
        }
        DType::F64 => {
            Tensor::from_shape(&shape, &le_chunks(bytes, f64::from_le_bytes)?).map_err(tract_err)?
        }
        other => {
            return Err(Status::internal(format!(
                "tensor element type {other} is not supported by the plan engine"
            )))
        }
    };
    Ok(value.into())
}

fn from_tract_value(value: &TValue) -> Result<EngineTensor> {
    let dtype = dtype_from_tract(value.datum_type())?;
    let dims: Vec<i64> = value.shape().iter().map(|&d| d as i64).collect();

    let bytes = match dtype {
        DType::Bool => {
            let data = value.as_slice::<bool>().map_err(tract_err)?;
            Bytes::from(data.iter().map(|&b| b as u8).collect::<Vec<u8>>())
        }
        DType::U8 => bytes_from_slice(value.as_slice::<u8>().map_err(tract_err)?),
        DType::I8 => bytes_from_slice(value.as_slice::<i8>().map_err(tract_err)?),
        DType::U16 => bytes_from_slice(value.as_slice::<u16>().map_err(tract_err)?),
        DType::I16 => bytes_from_slice(value.as_slice::<i16>().map_err(tract_err)?),
        DType::I32 => bytes_from_slice(value.as_slice::<i32>().map_err(tract_err)?),
        DType::I64 => bytes_from_slice(value.as_slice::<i64>().map_err(tract_err)?),
        DType::F32 => bytes_from_slice(value.as_slice::<f32>().map_err(tract_err)?),
        DType::F64 => bytes_from_slice(value.as_slice::<f64>().map_err(tract_err)?),
        other => {
            return Err(Status::internal(format!(
                "tensor element type {other} is not supported by the plan engine"
            )))
        }
    };
    EngineTensor::from_buffer(dtype, dims, bytes)
}

#[allow(clippy::manual_is_multiple_of)]
fn le_chunks<T, const N: usize>(bytes: &Bytes, convert: fn([u8; N]) -> T) -> Result<Vec<T>> {
    if bytes.len() % N != 0 {
        return Err(Status::internal(format!(
            "input buffer of {} bytes is not a whole number of {N}-byte elements",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut array = [0u8; N];
            array.copy_from_slice(chunk);
            convert(array)
        })
        .collect())
}

fn bytes_from_slice<T>(slice: &[T]) -> Bytes {
    let byte_len = std::mem::size_of_val(slice);
    let ptr = slice.as_ptr().cast::<u8>();
    let bytes = unsafe { std::slice::from_raw_parts(ptr, byte_len) };
    Bytes::copy_from_slice(bytes)
}
