//! Session-executor adapter over ONNX Runtime.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, ValueType};

use tensorport_core::{DType, Result, Status, TensorInfo};

use crate::{EngineTensor, GraphOptLevel, SessionOptions};

#[derive(Clone, Copy, Debug, Default)]
pub struct OrtEngine;

impl OrtEngine {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn load(&self, path: &Path, options: &SessionOptions) -> Result<OrtSession> {
        let builder = Session::builder()
            .and_then(|b| b.with_optimization_level(optimization_level(options.graph_level)))
            .and_then(|b| b.with_intra_threads(options.intra_op_threads.max(1) as usize))
            .map_err(ort_err)?;

        let builder = configure_accelerators(builder, options)?;

        let session = builder.commit_from_file(path).map_err(|e| {
            Status::engine(0, format!("failed to load session '{}': {e}", path.display()))
        })?;

        let inputs = session
            .inputs
            .iter()
            .map(|io| tensor_info(&io.name, &io.input_type))
            .collect::<Result<Vec<_>>>()?;
        let outputs = session
            .outputs
            .iter()
            .map(|io| tensor_info(&io.name, &io.output_type))
            .collect::<Result<Vec<_>>>()?;

        Ok(OrtSession {
            session,
            inputs,
            outputs,
        })
    }
}

pub struct OrtSession {
    session: Session,
    inputs: Vec<(String, TensorInfo)>,
    outputs: Vec<(String, TensorInfo)>,
}

impl OrtSession {
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
        if input_names.len() != inputs.len() {
            return Err(Status::internal(format!(
                "session got {} input names for {} tensors",
                input_names.len(),
                inputs.len()
            )));
        }

        let mut session_inputs = Vec::with_capacity(inputs.len());
        for (name, tensor) in input_names.iter().zip(inputs) {
            let value = to_ort_value(tensor)?;
            session_inputs.push((name.clone(), SessionInputValue::from(value)));
        }

        let outputs = self
            .session
            .run(session_inputs)
            .map_err(|e| Status::engine(0, e.to_string()))?;

        let mut results = Vec::with_capacity(output_names.len());
        for name in output_names {
            let mut found = None;
            for (out_name, value) in outputs.iter() {
                if out_name == name.as_str() {
                    found = Some(from_ort_value(&value)?);
                    break;
                }
            }
            results.push(found.ok_or_else(|| {
                Status::internal(format!("output tensor '{name}' not found"))
            })?);
        }
        Ok(results)
    }
}

fn ort_err(err: ort::Error) -> Status {
    Status::engine(0, err.to_string())
}

fn optimization_level(level: GraphOptLevel) -> GraphOptimizationLevel {
    match level {
        GraphOptLevel::Basic => GraphOptimizationLevel::Level1,
        GraphOptLevel::Extended => GraphOptimizationLevel::Level2,
        GraphOptLevel::Full => GraphOptimizationLevel::Level3,
    }
}

fn configure_accelerators(builder: SessionBuilder, options: &SessionOptions) -> Result<SessionBuilder> {
    let mut builder = builder;

    if let Some(device) = options.gpu_device {
        if options.tensorrt.is_some() {
            builder = configure_tensorrt(builder, options, device)?;
        }
        builder = configure_cuda(builder, device)?;
    }

    if options.openvino {
        builder = configure_openvino(builder)?;
    }

    Ok(builder)
}

fn configure_tensorrt(
    builder: SessionBuilder,
    options: &SessionOptions,
    device: i32,
) -> Result<SessionBuilder> {
    #[cfg(feature = "tensorrt")]
    {
        use ort::execution_providers::tensorrt::TensorRTExecutionProvider;
        let trt = options.tensorrt.unwrap_or_default();
        let ep = TensorRTExecutionProvider::default()
            .with_device_id(device)
            .with_fp16(matches!(trt.precision, crate::TrtPrecision::Fp16))
            .build();
        builder
            .with_execution_providers([ep])
            .map_err(ort_err)
    }
    #[cfg(not(feature = "tensorrt"))]
    {
        let _ = (builder, options, device);
        Err(Status::unavailable(
            "TensorRT execution accelerator is not compiled in",
        ))
    }
}

fn configure_cuda(builder: SessionBuilder, device: i32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device)
            .build();
        builder
            .with_execution_providers([ep])
            .map_err(ort_err)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = (builder, device);
        Err(Status::unavailable(
            "GPU instances require the `cuda` feature",
        ))
    }
}

fn configure_openvino(builder: SessionBuilder) -> Result<SessionBuilder> {
    #[cfg(feature = "openvino")]
    {
        use ort::execution_providers::openvino::OpenVINOExecutionProvider;
        let ep = OpenVINOExecutionProvider::default().build();
        builder
            .with_execution_providers([ep])
            .map_err(ort_err)
    }
    #[cfg(not(feature = "openvino"))]
    {
        let _ = builder;
        Err(Status::invalid_arg(
            "OpenVINO execution accelerator is not compiled in",
        ))
    }
}

fn tensor_info(name: &str, value_type: &ValueType) -> Result<(String, TensorInfo)> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        return Err(Status::internal(format!(
            "non-tensor io value '{name}' is not supported"
        )));
    };
    Ok((
        name.to_string(),
        TensorInfo::new(dtype_from_element(*ty)?, shape.to_vec()),
    ))
}

fn dtype_from_element(ty: TensorElementType) -> Result<DType> {
    match ty {
        TensorElementType::Bool => Ok(DType::Bool),
        TensorElementType::Uint8 => Ok(DType::U8),
        TensorElementType::Uint16 => Ok(DType::U16),
        TensorElementType::Uint32 => Ok(DType::U32),
        TensorElementType::Uint64 => Ok(DType::U64),
        TensorElementType::Int8 => Ok(DType::I8),
        TensorElementType::Int16 => Ok(DType::I16),
        TensorElementType::Int32 => Ok(DType::I32),
        TensorElementType::Int64 => Ok(DType::I64),
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Float64 => Ok(DType::F64),
        TensorElementType::String => Ok(DType::String),
        other => Err(Status::internal(format!(
            "unsupported tensor element type: {other}"
        ))),
    }
}

fn concrete_shape(dims: &[i64]) -> Result<Vec<usize>> {
    dims.iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                Status::internal(format!(
                    "session cannot run with unresolved shape {}",
                    tensorport_core::dims_to_string(dims)
                ))
            })
        })
        .collect()
}

fn to_ort_value(tensor: &EngineTensor) -> Result<DynValue> {
    let shape = concrete_shape(tensor.dims())?;

    let value = match tensor.dtype() {
        DType::Bool => {
            let data: Vec<bool> = tensor.data()?.iter().map(|&b| b != 0).collect();
            ort::value::Tensor::from_array((shape, data))
                .map_err(ort_err)?
                .into_dyn()
        }
        DType::U8 => ort::value::Tensor::from_array((shape, tensor.data()?.to_vec()))
            .map_err(ort_err)?
            .into_dyn(),
        DType::I32 => ort::value::Tensor::from_array((shape, le_chunks(tensor.data()?, i32::from_le_bytes)?))
            .map_err(ort_err)?
            .into_dyn(),
        DType::I64 => ort::value::Tensor::from_array((shape, le_chunks(tensor.data()?, i64::from_le_bytes)?))
            .map_err(ort_err)?
            .into_dyn(),
        DType::F32 => ort::value::Tensor::from_array((shape, le_chunks(tensor.data()?, f32::from_le_bytes)?))
            .map_err(ort_err)?
            .into_dyn(),
        DType::F64 => ort::value::Tensor::from_array((shape, le_chunks(tensor.data()?, f64::from_le_bytes)?))
            .map_err(ort_err)?
            .into_dyn(),
        other => {
            return Err(Status::internal(format!(
                "tensor element type {other} is not supported by the session adapter"
            )))
        }
    };
    Ok(value)
}

fn from_ort_value(value: &ort::value::ValueRef<'_>) -> Result<EngineTensor> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        return Err(Status::internal("non-tensor outputs are not supported"));
    };
    let dims: Vec<i64> = shape.to_vec();

    macro_rules! extract {
        ($t:ty, $dtype:expr) => {{
            let array = value.try_extract_array::<$t>().map_err(ort_err)?;
            let slice = array.as_slice().ok_or_else(|| {
                Status::internal("non-contiguous output tensor")
            })?;
            EngineTensor::from_buffer($dtype, dims, bytes_from_slice(slice))
        }};
    }

    match ty {
        TensorElementType::Bool => {
            let array = value.try_extract_array::<bool>().map_err(ort_err)?;
            let slice = array.as_slice().ok_or_else(|| {
                Status::internal("non-contiguous output tensor")
            })?;
            let data: Vec<u8> = slice.iter().map(|&b| b as u8).collect();
            EngineTensor::from_buffer(DType::Bool, dims, Bytes::from(data))
        }
        TensorElementType::Uint8 => extract!(u8, DType::U8),
        TensorElementType::Int32 => extract!(i32, DType::I32),
        TensorElementType::Int64 => extract!(i64, DType::I64),
        TensorElementType::Float32 => extract!(f32, DType::F32),
        TensorElementType::Float64 => extract!(f64, DType::F64),
        other => Err(Status::internal(format!(
            "unsupported output tensor element type: {other}"
        ))),
    }
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
