//! Request-scoped staging buffers, device streams, and placement-aware
//! copies.

use bytes::{Bytes, BytesMut};

use tensorport_core::{MemoryKind, Result, Status};

/// A staging buffer with a preferred and an actual placement.
///
/// The preferred kind is a hint; when it cannot be honored (pinned or device
/// memory without GPU support compiled in) the allocation falls back to
/// pageable host memory and reports what it actually produced.
#[derive(Debug)]
pub struct AllocatedMemory {
    buf: BytesMut,
    kind: MemoryKind,
    id: i64,
}

impl AllocatedMemory {
    pub fn new(byte_size: usize, preferred: MemoryKind, _preferred_id: i64) -> Self {
        // Pinned and device allocations need the CUDA runtime; this build
        // satisfies every request from pageable host memory.
        let _ = preferred;
        Self {
            buf: BytesMut::zeroed(byte_size),
            kind: MemoryKind::Pageable,
            id: 0,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.buf.len()
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Freeze into an immutable buffer for zero-copy handoff to an engine
    /// tensor. No further writes may land in this allocation afterwards.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// One asynchronous work queue owned by a GPU-bound execution context.
///
/// All cross-device copies for the context's runs are enqueued here, so they
/// are FIFO-ordered against each other; host-visible data is only assumed
/// after `synchronize`.
#[derive(Debug)]
pub struct DeviceStream {
    device: i32,
}

impl DeviceStream {
    pub fn new(device: i32) -> Result<Self> {
        Err(Status::unavailable(format!(
            "unable to create stream for GPU {device}: GPU support is not compiled in"
        )))
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

/// Copy `src` into `dst`, taking memory placement into account.
///
/// Returns whether the copy was enqueued asynchronously on a device queue,
/// in which case the destination is not host-visible until the stream is
/// synchronized.
pub fn copy_buffer(
    name: &str,
    src_kind: MemoryKind,
    _src_id: i64,
    dst_kind: MemoryKind,
    _dst_id: i64,
    src: &[u8],
    dst: &mut [u8],
    _stream: Option<&DeviceStream>,
) -> Result<bool> {
    if src.len() != dst.len() {
        return Err(Status::internal(format!(
            "failed to copy buffer '{name}': source is {} bytes, destination is {} bytes",
            src.len(),
            dst.len()
        )));
    }

    if src_kind.is_device() || dst_kind.is_device() {
        return Err(Status::unavailable(format!(
            "failed to copy buffer '{name}' from {src_kind} to {dst_kind}: GPU support is not compiled in"
        )));
    }

    dst.copy_from_slice(src);
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_request_falls_back_and_reports_actual_kind() {
        let mem = AllocatedMemory::new(64, MemoryKind::Pinned, 0);
        assert_eq!(mem.kind(), MemoryKind::Pageable);
        assert_eq!(mem.id(), 0);
        assert_eq!(mem.byte_size(), 64);
        assert!(mem.buffer().iter().all(|&b| b == 0));
    }

    #[test]
    fn host_copy_is_synchronous() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        let enqueued = copy_buffer(
            "t",
            MemoryKind::Pageable,
            0,
            MemoryKind::Pageable,
            0,
            &src,
            &mut dst,
            None,
        )
        .unwrap();
        assert!(!enqueued);
        assert_eq!(dst, src);
    }

    #[test]
    fn size_mismatch_is_internal() {
        let src = [1u8, 2];
        let mut dst = [0u8; 4];
        let err = copy_buffer(
            "t",
            MemoryKind::Pageable,
            0,
            MemoryKind::Pageable,
            0,
            &src,
            &mut dst,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Status::Internal(_)));
    }

    #[test]
    fn device_copy_is_unavailable_without_gpu_support() {
        let src = [1u8; 4];
        let mut dst = [0u8; 4];
        let err = copy_buffer(
            "t",
            MemoryKind::Device,
            0,
            MemoryKind::Pageable,
            0,
            &src,
            &mut dst,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Status::Unavailable(_)));
    }

    #[test]
    fn stream_creation_is_unavailable_without_gpu_support() {
        assert!(matches!(
            DeviceStream::new(0),
            Err(Status::Unavailable(_))
        ));
    }

    #[test]
    fn freeze_hands_out_the_written_bytes() {
        let mut mem = AllocatedMemory::new(4, MemoryKind::Pageable, 0);
        mem.buffer_mut().copy_from_slice(&[9, 8, 7, 6]);
        assert_eq!(mem.freeze().as_ref(), &[9, 8, 7, 6]);
    }
}
