use bytes::{Bytes, BytesMut};

use tensorport_core::{element_count, DType, Dims, Result, Status};

/// Tensor value exchanged with an engine adapter.
///
/// Fixed-size tensors wrap their backing buffer zero-copy. String tensors
/// hold one byte slice per element; the slices usually alias the staging
/// buffer they were parsed from.
#[derive(Clone, Debug)]
pub struct EngineTensor {
    dtype: DType,
    dims: Dims,
    data: TensorData,
}

#[derive(Clone, Debug)]
enum TensorData {
    Fixed(Bytes),
    Strings(Vec<Bytes>),
}

impl EngineTensor {
    /// Wrap a contiguous buffer as a fixed-size tensor without copying.
    pub fn from_buffer(dtype: DType, dims: Vec<i64>, data: Bytes) -> Result<Self> {
        let element_size = dtype.byte_size().ok_or_else(|| {
            Status::internal(format!("dtype {dtype} cannot wrap a raw buffer"))
        })?;
        if let Some(count) = element_count(&dims) {
            let expected = count as usize * element_size;
            if data.len() != expected {
                return Err(Status::internal(format!(
                    "tensor byte size mismatch: got {}, expected {expected}",
                    data.len()
                )));
            }
        }
        Ok(Self {
            dtype,
            dims: dims.into(),
            data: TensorData::Fixed(data),
        })
    }

    /// An empty string tensor; elements arrive through `fill_strings`.
    pub fn new_string(dims: Vec<i64>) -> Self {
        Self {
            dtype: DType::String,
            dims: dims.into(),
            data: TensorData::Strings(Vec::new()),
        }
    }

    pub fn fill_strings(&mut self, elements: Vec<Bytes>) -> Result<()> {
        match &mut self.data {
            TensorData::Strings(slot) => {
                *slot = elements;
                Ok(())
            }
            TensorData::Fixed(_) => Err(Status::internal(
                "fill_strings called on a fixed-size tensor",
            )),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn type_and_shape(&self) -> (DType, &[i64]) {
        (self.dtype, self.dims.as_slice())
    }

    /// Element count from the (fully specified) engine shape.
    pub fn element_count(&self) -> Result<usize> {
        element_count(&self.dims)
            .map(|c| c as usize)
            .ok_or_else(|| {
                Status::internal(format!(
                    "engine tensor has unresolved dims {}",
                    tensorport_core::dims_to_string(&self.dims)
                ))
            })
    }

    /// Raw bytes of a fixed-size tensor.
    pub fn data(&self) -> Result<&Bytes> {
        match &self.data {
            TensorData::Fixed(bytes) => Ok(bytes),
            TensorData::Strings(_) => Err(Status::internal(
                "raw data requested from a string tensor",
            )),
        }
    }

    pub fn string_elements(&self) -> Result<&[Bytes]> {
        match &self.data {
            TensorData::Strings(elements) => Ok(elements),
            TensorData::Fixed(_) => Err(Status::internal(
                "string elements requested from a fixed-size tensor",
            )),
        }
    }

    /// Concatenated string contents plus element offsets.
    ///
    /// `offsets` has `element_count + 1` entries; the final entry is the
    /// total content length, so `offsets[i]..offsets[i+1]` is element `i`.
    pub fn string_content(&self) -> Result<(Bytes, Vec<usize>)> {
        let elements = self.string_elements()?;
        let total: usize = elements.iter().map(|e| e.len()).sum();
        let mut content = BytesMut::with_capacity(total);
        let mut offsets = Vec::with_capacity(elements.len() + 1);
        let mut pos = 0usize;
        offsets.push(0);
        for element in elements {
            content.extend_from_slice(element);
            pos += element.len();
            offsets.push(pos);
        }
        Ok((content.freeze(), offsets))
    }
}
