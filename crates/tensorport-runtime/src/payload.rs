//! Scheduler payloads, request views, and the response-provider contract.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use tensorport_core::{DType, MemoryKind, Result, Status};

use crate::memory::{copy_buffer, DeviceStream};

/// One request's view of a named input.
#[derive(Clone, Debug)]
pub struct RequestInput {
    pub dtype: DType,
    /// Declared per-request dims, without the batch axis.
    pub dims: Vec<i64>,
    /// Serialized byte size of the whole input. The request normalizer
    /// guarantees this for string inputs; fixed-size inputs derive it from
    /// the shape.
    pub batch_byte_size: u64,
    /// Input content as one or more chunks, concatenated in order.
    pub content: Vec<Bytes>,
}

impl RequestInput {
    pub fn contiguous(dtype: DType, dims: Vec<i64>, data: Bytes) -> Self {
        Self {
            dtype,
            dims,
            batch_byte_size: data.len() as u64,
            content: vec![data],
        }
    }

    pub fn total_content_bytes(&self) -> usize {
        self.content.iter().map(|c| c.len()).sum()
    }
}

/// Immutable view of one inference request inside a batch.
#[derive(Clone, Debug, Default)]
pub struct InferenceRequest {
    pub batch_size: u32,
    pub inputs: Vec<(String, RequestInput)>,
}

impl InferenceRequest {
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size,
            inputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, input: RequestInput) -> Self {
        self.inputs.push((name.into(), input));
        self
    }

    pub fn input(&self, name: &str) -> Option<&RequestInput> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, input)| input)
    }
}

/// A destination buffer handed out by a response provider.
///
/// The provider keeps the storage; writers copy into it through this handle,
/// possibly asynchronously via the context's stream.
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    kind: MemoryKind,
    id: i64,
    data: Arc<Mutex<BytesMut>>,
}

impl OutputBuffer {
    pub fn new(byte_size: usize, kind: MemoryKind, id: i64) -> Self {
        Self {
            kind,
            id,
            data: Arc::new(Mutex::new(BytesMut::zeroed(byte_size))),
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn byte_size(&self) -> usize {
        self.data.lock().len()
    }

    /// Copy `src` into the buffer at `offset`, honoring memory placement.
    pub fn copy_from(
        &self,
        name: &str,
        src_kind: MemoryKind,
        src_id: i64,
        offset: usize,
        src: &[u8],
        stream: Option<&DeviceStream>,
    ) -> Result<bool> {
        let mut guard = self.data.lock();
        let total = guard.len();
        let end = offset + src.len();
        let dst = guard.get_mut(offset..end).ok_or_else(|| {
            Status::internal(format!(
                "output buffer for '{name}' is too small: writing {offset}..{end} into {total} bytes"
            ))
        })?;
        copy_buffer(name, src_kind, src_id, self.kind, self.id, src, dst, stream)
    }

    /// Snapshot of the current contents.
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.lock())
    }
}

/// Where a payload's outputs land.
pub trait ResponseProvider: Send {
    fn requires_output(&self, name: &str) -> bool;

    /// Allocate the destination for one output. The actual placement may
    /// differ from the preferred one and is reported on the returned buffer.
    fn allocate_output_buffer(
        &mut self,
        name: &str,
        byte_size: usize,
        shape: &[i64],
        preferred: MemoryKind,
        preferred_id: i64,
    ) -> Result<OutputBuffer>;
}

/// Response provider that keeps every output in host memory.
///
/// Clones share storage, so a caller can keep a handle while the payload
/// (and the boxed provider inside it) travels through a runner.
#[derive(Clone, Debug, Default)]
pub struct InMemoryResponse {
    /// `None` requests every produced output.
    requested: Option<BTreeSet<String>>,
    outputs: Arc<Mutex<HashMap<String, (Vec<i64>, OutputBuffer)>>>,
}

impl InMemoryResponse {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn requesting<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            requested: Some(names.into_iter().map(Into::into).collect()),
            outputs: Arc::default(),
        }
    }

    pub fn output(&self, name: &str) -> Option<(Vec<i64>, Bytes)> {
        self.outputs
            .lock()
            .get(name)
            .map(|(shape, buf)| (shape.clone(), buf.contents()))
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.lock().keys().cloned().collect()
    }
}

impl ResponseProvider for InMemoryResponse {
    fn requires_output(&self, name: &str) -> bool {
        match &self.requested {
            Some(names) => names.contains(name),
            None => true,
        }
    }

    fn allocate_output_buffer(
        &mut self,
        name: &str,
        byte_size: usize,
        shape: &[i64],
        _preferred: MemoryKind,
        _preferred_id: i64,
    ) -> Result<OutputBuffer> {
        let buffer = OutputBuffer::new(byte_size, MemoryKind::Pageable, 0);
        self.outputs
            .lock()
            .insert(name.to_string(), (shape.to_vec(), buffer.clone()));
        Ok(buffer)
    }
}

/// Timestamps captured while a batch moves through a runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimestampKind {
    ComputeStart,
    ComputeInputEnd,
    ComputeOutputStart,
    ComputeEnd,
}

/// Per-payload stat sink. Updated under a single mutex that is never held
/// across engine calls or allocations.
#[derive(Clone, Debug, Default)]
pub struct StatSink {
    inner: Arc<Mutex<HashMap<TimestampKind, Instant>>>,
}

impl StatSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&self, kind: TimestampKind) {
        self.inner.lock().insert(kind, Instant::now());
    }

    pub fn timestamp(&self, kind: TimestampKind) -> Option<Instant> {
        self.inner.lock().get(&kind).copied()
    }
}

/// One in-flight request inside a batched run.
pub struct Payload {
    pub request: Arc<InferenceRequest>,
    pub status: Result<()>,
    pub response: Option<Box<dyn ResponseProvider>>,
    pub stats: Option<StatSink>,
}

impl Payload {
    pub fn new(request: InferenceRequest) -> Self {
        Self {
            request: Arc::new(request),
            status: Ok(()),
            response: None,
            stats: None,
        }
    }

    pub fn with_response(mut self, response: impl ResponseProvider + 'static) -> Self {
        self.response = Some(Box::new(response));
        self
    }

    pub fn with_stats(mut self, stats: StatSink) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = Err(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_input_lookup() {
        let request = InferenceRequest::new(2).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![4], Bytes::from(vec![0u8; 32])),
        );
        assert_eq!(request.input("x").unwrap().batch_byte_size, 32);
        assert!(request.input("y").is_none());
    }

    #[test]
    fn output_buffer_bounds_check() {
        let buf = OutputBuffer::new(4, MemoryKind::Pageable, 0);
        let err = buf
            .copy_from("y", MemoryKind::Pageable, 0, 2, &[1, 2, 3], None)
            .unwrap_err();
        assert!(matches!(err, Status::Internal(_)));

        buf.copy_from("y", MemoryKind::Pageable, 0, 1, &[7, 8], None)
            .unwrap();
        assert_eq!(buf.contents().as_ref(), &[0, 7, 8, 0]);
    }

    #[test]
    fn in_memory_response_filters_requested_outputs() {
        let response = InMemoryResponse::requesting(["y"]);
        assert!(response.requires_output("y"));
        assert!(!response.requires_output("z"));

        let all = InMemoryResponse::all();
        assert!(all.requires_output("anything"));
    }

    #[test]
    fn stat_sink_captures_once_per_kind() {
        let sink = StatSink::new();
        assert!(sink.timestamp(TimestampKind::ComputeInputEnd).is_none());
        sink.capture(TimestampKind::ComputeInputEnd);
        assert!(sink.timestamp(TimestampKind::ComputeInputEnd).is_some());
    }

    #[test]
    fn payload_status_transitions() {
        let mut payload = Payload::new(InferenceRequest::new(1));
        assert!(payload.is_ok());
        payload.set_status(Status::invalid_arg("bad input"));
        assert!(!payload.is_ok());
    }
}
