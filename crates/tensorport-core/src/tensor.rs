use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::{DType, Result, Status};

/// Shape dims as reported by engines and declared in configs. `-1` means
/// dynamic.
pub type Dims = SmallVec<[i64; 6]>;

/// Device ordinal of a CPU-bound context.
pub const NO_GPU_DEVICE: i32 = -1;
/// Device ordinal of a context whose placement is encoded in the model file.
pub const MODEL_DEVICE: i32 = -2;
/// `max_batch_size` value of a model that does not support batching.
pub const NO_BATCHING: i32 = 0;

/// Metadata for one tensor discovered from a loaded session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    pub dtype: DType,
    pub dims: Vec<i64>,
}

impl TensorInfo {
    pub fn new(dtype: DType, dims: Vec<i64>) -> Self {
        Self { dtype, dims }
    }
}

/// Memory placement of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Pageable,
    Pinned,
    Device,
}

impl MemoryKind {
    pub fn is_device(self) -> bool {
        self == MemoryKind::Device
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MemoryKind::Pageable => "pageable",
            MemoryKind::Pinned => "pinned",
            MemoryKind::Device => "device",
        })
    }
}

/// Number of elements in a fully-specified shape, `None` when any dim is
/// dynamic or the product overflows.
pub fn element_count(dims: &[i64]) -> Option<i64> {
    let mut count: i64 = 1;
    for &dim in dims {
        if dim < 0 {
            return None;
        }
        count = count.checked_mul(dim)?;
    }
    Some(count)
}

/// `[3,4,5]`-style rendering for error messages.
pub fn dims_to_string(dims: &[i64]) -> String {
    let inner = dims
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{inner}]")
}

/// Serialize string elements into the wire form: per element a `u32`
/// little-endian length followed by the raw bytes, concatenated with no
/// terminator and no padding.
pub fn encode_string_elements<I, B>(elements: I) -> Bytes
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut out = BytesMut::new();
    for element in elements {
        let element = element.as_ref();
        out.put_u32_le(element.len() as u32);
        out.put_slice(element);
    }
    out.freeze()
}

/// Decode a full wire buffer into exactly `expected` elements.
///
/// The batched marshaller has its own incremental parse with per-payload
/// error semantics; this strict form is for tests and tooling.
pub fn decode_string_elements(buf: &Bytes, expected: usize) -> Result<Vec<Bytes>> {
    let mut out = Vec::with_capacity(expected);
    let mut pos = 0usize;
    while buf.len() - pos >= 4 {
        if out.len() >= expected {
            return Err(Status::invalid_arg(format!(
                "unexpected number of string elements {}, expecting {}",
                out.len() + 1,
                expected
            )));
        }
        let len =
            u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if len > buf.len() - pos {
            return Err(Status::invalid_arg(format!(
                "incomplete string data, expecting string of length {len} but only {} bytes available",
                buf.len() - pos
            )));
        }
        out.push(buf.slice(pos..pos + len));
        pos += len;
    }
    if pos != buf.len() {
        return Err(Status::invalid_arg(format!(
            "{} trailing bytes after string elements",
            buf.len() - pos
        )));
    }
    if out.len() != expected {
        return Err(Status::invalid_arg(format!(
            "expected {expected} string elements, got {}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_count_of_static_shape() {
        assert_eq!(element_count(&[2, 3, 4]), Some(24));
        assert_eq!(element_count(&[]), Some(1));
    }

    #[test]
    fn element_count_of_dynamic_shape() {
        assert_eq!(element_count(&[2, -1, 4]), None);
    }

    #[test]
    fn dims_render() {
        assert_eq!(dims_to_string(&[3, 4, 5]), "[3,4,5]");
        assert_eq!(dims_to_string(&[]), "[]");
    }

    #[test]
    fn string_wire_round_trip() {
        let encoded = encode_string_elements(["abcd".as_bytes(), b"", b"xy"]);
        let expected: &[u8] = &[
            4, 0, 0, 0, b'a', b'b', b'c', b'd', 0, 0, 0, 0, 2, 0, 0, 0, b'x', b'y',
        ];
        assert_eq!(&encoded[..], expected);

        let decoded = decode_string_elements(&encoded, 3).unwrap();
        assert_eq!(decoded[0].as_ref(), b"abcd");
        assert_eq!(decoded[1].as_ref(), b"");
        assert_eq!(decoded[2].as_ref(), b"xy");
    }

    #[test]
    fn empty_string_is_four_zero_bytes() {
        let encoded = encode_string_elements([b"" as &[u8]]);
        assert_eq!(&encoded[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn decode_rejects_truncated_element() {
        let buf = Bytes::from_static(&[8, 0, 0, 0, b'a', b'b']);
        let err = decode_string_elements(&buf, 1).unwrap_err();
        assert!(matches!(err, Status::InvalidArg(_)));
        assert!(err.to_string().contains("incomplete string data"));
    }

    #[test]
    fn decode_rejects_extra_elements() {
        let encoded = encode_string_elements([b"a" as &[u8], b"b"]);
        let err = decode_string_elements(&encoded, 1).unwrap_err();
        assert!(err.to_string().contains("unexpected number of string elements"));
    }
}
