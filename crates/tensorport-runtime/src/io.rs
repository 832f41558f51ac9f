//! Batched tensor I/O: gather request inputs into engine tensors and
//! scatter engine outputs back out to response providers.

use bytes::Bytes;

use tensorport_core::{DType, MemoryKind, Result, Status, NO_BATCHING};
use tensorport_engine::EngineTensor;

use crate::memory::{copy_buffer, AllocatedMemory, DeviceStream};
use crate::payload::{OutputBuffer, Payload};

/// A staging buffer whose contents are gathered into the contiguous batch
/// tensor with a deferred stream copy.
pub struct IndirectBuffer {
    pub source: AllocatedMemory,
    pub dest_offset: usize,
    /// Payloads whose status must be failed if the copy fails.
    pub payload_idxs: Vec<usize>,
}

/// A staging buffer scattered out to per-payload output buffers with
/// deferred stream copies.
pub struct OutputIndirect {
    pub source: AllocatedMemory,
    pub targets: Vec<(usize, OutputBuffer)>,
}

/// One input staged for the whole batch: the contiguous buffer holding every
/// payload's slot, plus the bookkeeping needed to turn it into an engine
/// tensor.
pub struct InputAssembly {
    config_name: String,
    engine_name: String,
    dtype: DType,
    batched_dims: Vec<i64>,
    buffer: AllocatedMemory,
    total_byte_size: usize,
    expected_byte_sizes: Vec<usize>,
    expected_element_cnts: Vec<usize>,
    copied_byte_sizes: Vec<usize>,
    pub indirect: Vec<IndirectBuffer>,
    device_copy: bool,
}

/// Stage one input: size the buffer for the total batch and gather every
/// payload's content into its slot.
///
/// Failed payloads keep their slot (zeroed) so later payloads stay aligned.
/// Fixed-size content whose length disagrees with the declared shape fails
/// that payload only; string content is validated during the parse in
/// `into_tensor`. With pinned input staging enabled, content is gathered
/// into a pinned staging buffer instead and flushed into the batch tensor
/// by `apply_indirect`.
#[allow(clippy::too_many_arguments)]
pub fn stage_input(
    config_name: &str,
    engine_name: &str,
    dtype: DType,
    dims: &[i64],
    total_batch_size: usize,
    max_batch_size: i32,
    enable_pinned: bool,
    payloads: &mut [Payload],
    stream: Option<&DeviceStream>,
) -> Result<InputAssembly> {
    let mut batched_dims = Vec::with_capacity(dims.len() + 1);
    if max_batch_size != NO_BATCHING {
        batched_dims.push(total_batch_size as i64);
    }
    let mut batch1_element_cnt = 1usize;
    for &dim in dims {
        if dim < 0 {
            return Err(Status::internal(format!(
                "request input '{config_name}' has unresolved dim in shape {}",
                tensorport_core::dims_to_string(dims)
            )));
        }
        batched_dims.push(dim);
        batch1_element_cnt *= dim as usize;
    }

    let mut expected_byte_sizes = Vec::with_capacity(payloads.len());
    let mut expected_element_cnts = Vec::with_capacity(payloads.len());
    let mut total_byte_size = 0usize;
    for payload in payloads.iter() {
        let element_cnt = payload.request.batch_size as usize * batch1_element_cnt;
        expected_element_cnts.push(element_cnt);

        let byte_size = if dtype.is_string() {
            // The request normalizer guarantees batch_byte_size for strings.
            let input = payload.request.input(config_name).ok_or_else(|| {
                Status::internal(format!(
                    "request does not provide input '{config_name}'"
                ))
            })?;
            input.batch_byte_size as usize
        } else {
            let type_size = dtype.byte_size().ok_or_else(|| {
                Status::internal(format!("unsupported datatype {dtype}"))
            })?;
            element_cnt * type_size
        };
        expected_byte_sizes.push(byte_size);
        total_byte_size += byte_size;
    }

    // One slack byte at the end of string buffers so the final element can
    // be terminated in place.
    let buffer_size = total_byte_size + usize::from(dtype.is_string());
    let mut buffer = AllocatedMemory::new(buffer_size, MemoryKind::Pageable, 0);

    let mut copied_byte_sizes = vec![0usize; payloads.len()];
    let mut indirect = Vec::new();
    let device_copy;
    if enable_pinned {
        // Gather into a pinned staging buffer; one deferred stream copy
        // flushes it into the batch tensor in `apply_indirect`.
        let mut staging = AllocatedMemory::new(total_byte_size, MemoryKind::Pinned, 0);
        let staging_kind = staging.kind();
        let staging_id = staging.id();
        device_copy = gather_content(
            config_name,
            dtype,
            &expected_byte_sizes,
            staging_kind,
            staging_id,
            staging.buffer_mut(),
            payloads,
            stream,
            &mut copied_byte_sizes,
        )?;
        // A failed flush must fail everything the staging buffer carries.
        let payload_idxs = payloads
            .iter()
            .enumerate()
            .filter(|(_, payload)| payload.is_ok())
            .map(|(idx, _)| idx)
            .collect();
        indirect.push(IndirectBuffer {
            source: staging,
            dest_offset: 0,
            payload_idxs,
        });
    } else {
        let buffer_kind = buffer.kind();
        let buffer_id = buffer.id();
        device_copy = gather_content(
            config_name,
            dtype,
            &expected_byte_sizes,
            buffer_kind,
            buffer_id,
            buffer.buffer_mut(),
            payloads,
            stream,
            &mut copied_byte_sizes,
        )?;
    }

    Ok(InputAssembly {
        config_name: config_name.to_string(),
        engine_name: engine_name.to_string(),
        dtype,
        batched_dims,
        buffer,
        total_byte_size,
        expected_byte_sizes,
        expected_element_cnts,
        copied_byte_sizes,
        indirect,
        device_copy,
    })
}

/// Copy every payload's input content into its slot of `dst`.
///
/// `dst` is laid out as one `expected_byte_sizes[idx]` slot per payload;
/// failed payloads leave their slot zeroed.
#[allow(clippy::too_many_arguments)]
fn gather_content(
    config_name: &str,
    dtype: DType,
    expected_byte_sizes: &[usize],
    dst_kind: MemoryKind,
    dst_id: i64,
    dst: &mut [u8],
    payloads: &mut [Payload],
    stream: Option<&DeviceStream>,
    copied_byte_sizes: &mut [usize],
) -> Result<bool> {
    let mut device_copy = false;
    let mut slot_offset = 0usize;
    for (idx, payload) in payloads.iter_mut().enumerate() {
        let expected = expected_byte_sizes[idx];
        if payload.is_ok() {
            let Some(input) = payload.request.input(config_name) else {
                return Err(Status::internal(format!(
                    "request does not provide input '{config_name}'"
                )));
            };
            let content_bytes = input.total_content_bytes();
            if content_bytes > expected || (!dtype.is_string() && content_bytes != expected) {
                payload.set_status(Status::invalid_arg(format!(
                    "unexpected size {content_bytes} for inference input '{config_name}', expecting {expected}"
                )));
            } else {
                let mut copied = 0usize;
                for chunk in &input.content {
                    let target =
                        &mut dst[slot_offset + copied..slot_offset + copied + chunk.len()];
                    match copy_buffer(
                        config_name,
                        MemoryKind::Pageable,
                        0,
                        dst_kind,
                        dst_id,
                        chunk,
                        target,
                        stream,
                    ) {
                        Ok(enqueued) => device_copy |= enqueued,
                        Err(status) => {
                            payload.set_status(status);
                            break;
                        }
                    }
                    copied += chunk.len();
                }
                if payload.is_ok() {
                    copied_byte_sizes[idx] = copied;
                }
            }
        }
        slot_offset += expected;
    }
    Ok(device_copy)
}

impl InputAssembly {
    /// Whether staging enqueued an asynchronous device copy.
    pub fn device_copy(&self) -> bool {
        self.device_copy
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Apply deferred gathers into the staging buffer on the stream.
    ///
    /// A failed gather fails only the payloads it carried.
    pub fn apply_indirect(
        &mut self,
        payloads: &mut [Payload],
        stream: Option<&DeviceStream>,
    ) -> Result<bool> {
        let buffer_kind = self.buffer.kind();
        let buffer_id = self.buffer.id();
        let mut device_copy = false;
        for gather in &self.indirect {
            let end = gather.dest_offset + gather.source.byte_size();
            let result = match self.buffer.buffer_mut().get_mut(gather.dest_offset..end) {
                Some(dst) => copy_buffer(
                    "indirect buffer",
                    gather.source.kind(),
                    gather.source.id(),
                    buffer_kind,
                    buffer_id,
                    gather.source.buffer(),
                    dst,
                    stream,
                ),
                None => Err(Status::internal(format!(
                    "indirect buffer for '{}' writes {}..{end} beyond the staged {} bytes",
                    self.config_name,
                    gather.dest_offset,
                    self.total_byte_size
                ))),
            };
            match result {
                Ok(enqueued) => device_copy |= enqueued,
                Err(status) => {
                    for &idx in &gather.payload_idxs {
                        if let Some(payload) = payloads.get_mut(idx) {
                            payload.set_status(status.clone());
                        }
                    }
                }
            }
        }
        Ok(device_copy)
    }

    /// Finish staging: wrap the buffer as the engine tensor.
    ///
    /// For strings this parses each payload's slot as (`u32` length, bytes)
    /// elements; malformed data fails that payload and its remaining
    /// elements are padded with empty strings so the engine still sees the
    /// full element count. The caller must have synchronized the stream
    /// first — the parse needs host-visible data.
    pub fn into_tensor(self, payloads: &mut [Payload]) -> Result<(String, EngineTensor)> {
        let InputAssembly {
            config_name,
            engine_name,
            dtype,
            batched_dims,
            buffer,
            total_byte_size,
            expected_byte_sizes,
            expected_element_cnts,
            copied_byte_sizes,
            ..
        } = self;

        let staged = buffer.freeze();

        if !dtype.is_string() {
            let tensor =
                EngineTensor::from_buffer(dtype, batched_dims, staged.slice(0..total_byte_size))?;
            return Ok((engine_name, tensor));
        }

        let mut elements: Vec<Bytes> = Vec::new();
        let mut slot_offset = 0usize;
        for (idx, payload) in payloads.iter_mut().enumerate() {
            let expected_element_cnt = expected_element_cnts[idx];
            let mut element_cnt = 0usize;
            if payload.is_ok() {
                let mut pos = slot_offset;
                let end = slot_offset + copied_byte_sizes[idx];
                while end - pos >= 4 {
                    if element_cnt >= expected_element_cnt {
                        payload.set_status(Status::invalid_arg(format!(
                            "unexpected number of string elements {} for inference input '{config_name}', expecting {expected_element_cnt}",
                            element_cnt + 1
                        )));
                        break;
                    }
                    let len = u32::from_le_bytes([
                        staged[pos],
                        staged[pos + 1],
                        staged[pos + 2],
                        staged[pos + 3],
                    ]) as usize;
                    pos += 4;
                    let remaining = end - pos;
                    if len > remaining {
                        payload.set_status(Status::invalid_arg(format!(
                            "incomplete string data for inference input '{config_name}', expecting string of length {len} but only {remaining} bytes available"
                        )));
                        break;
                    }
                    elements.push(staged.slice(pos..pos + len));
                    pos += len;
                    element_cnt += 1;
                }
            }
            // Pad so the engine still sees the declared element count.
            for _ in element_cnt..expected_element_cnt {
                elements.push(Bytes::new());
            }
            slot_offset += expected_byte_sizes[idx];
        }

        let mut tensor = EngineTensor::new_string(batched_dims);
        tensor.fill_strings(elements)?;
        Ok((engine_name, tensor))
    }
}

/// Scatter one fixed-size output across the payloads that requested it.
///
/// A size disagreement with the configuration is a batch-level error;
/// allocation or copy failures fail only the affected payload. With pinned
/// output staging enabled, each payload's slice is copied into a pinned
/// staging buffer and the per-payload scatter is deferred to
/// `apply_output_indirect` via the `indirects` list.
#[allow(clippy::too_many_arguments)]
pub fn scatter_fixed_output(
    name: &str,
    tensor: &EngineTensor,
    expected_dtype: DType,
    total_batch_size: usize,
    enable_pinned: bool,
    payloads: &mut [Payload],
    stream: Option<&DeviceStream>,
    indirects: &mut Vec<OutputIndirect>,
) -> Result<bool> {
    let (dtype, dims) = tensor.type_and_shape();
    if dtype != expected_dtype {
        return Err(Status::invalid_arg(format!(
            "unexpected datatype {dtype} for inference output '{name}', expecting {expected_dtype}"
        )));
    }
    let type_size = expected_dtype.byte_size().ok_or_else(|| {
        Status::internal(format!("unsupported datatype {expected_dtype}"))
    })?;
    let element_count = tensor.element_count()?;
    let expected_byte_size = element_count * type_size;
    let batch1_byte_size = expected_byte_size / total_batch_size;
    let data = tensor.data()?;
    if data.len() != expected_byte_size {
        return Err(Status::internal(format!(
            "unexpected size for output '{name}', byte-size {} does not equal {total_batch_size} * {batch1_byte_size}",
            data.len()
        )));
    }

    // Engine outputs are reported host-resident.
    let dims = dims.to_vec();
    let mut device_copy = false;
    let mut content_offset = 0usize;

    if enable_pinned {
        // Stage requesting payloads' slices contiguously in pinned memory;
        // the deferred copies land in their output buffers on the stream.
        let mut staging = AllocatedMemory::new(expected_byte_size, MemoryKind::Pinned, 0);
        let staging_kind = staging.kind();
        let staging_id = staging.id();
        let mut targets = Vec::new();
        let mut staged_offset = 0usize;
        for (idx, payload) in payloads.iter_mut().enumerate() {
            let payload_byte_size = payload.request.batch_size as usize * batch1_byte_size;
            if let Some(response) = payload.response.as_mut() {
                if response.requires_output(name) {
                    match response.allocate_output_buffer(
                        name,
                        payload_byte_size,
                        &dims,
                        MemoryKind::Pinned,
                        0,
                    ) {
                        Ok(buffer) => {
                            let src = &data[content_offset..content_offset + payload_byte_size];
                            let dst = &mut staging.buffer_mut()
                                [staged_offset..staged_offset + payload_byte_size];
                            match copy_buffer(
                                name,
                                MemoryKind::Pageable,
                                0,
                                staging_kind,
                                staging_id,
                                src,
                                dst,
                                stream,
                            ) {
                                Ok(enqueued) => {
                                    device_copy |= enqueued;
                                    targets.push((idx, buffer));
                                    staged_offset += payload_byte_size;
                                }
                                Err(status) => payload.set_status(status),
                            }
                        }
                        Err(status) => payload.set_status(status),
                    }
                }
            }
            content_offset += payload_byte_size;
        }
        if !targets.is_empty() {
            indirects.push(OutputIndirect {
                source: staging,
                targets,
            });
        }
        return Ok(device_copy);
    }

    for payload in payloads.iter_mut() {
        let payload_byte_size = payload.request.batch_size as usize * batch1_byte_size;
        if let Some(response) = payload.response.as_mut() {
            if response.requires_output(name) {
                let status = match response.allocate_output_buffer(
                    name,
                    payload_byte_size,
                    &dims,
                    MemoryKind::Pageable,
                    0,
                ) {
                    Ok(buffer) => buffer
                        .copy_from(
                            name,
                            MemoryKind::Pageable,
                            0,
                            0,
                            &data[content_offset..content_offset + payload_byte_size],
                            stream,
                        )
                        .map(|enqueued| device_copy |= enqueued),
                    Err(status) => Err(status),
                };
                if let Err(status) = status {
                    payload.set_status(status);
                }
            }
        }
        content_offset += payload_byte_size;
    }
    Ok(device_copy)
}

/// Scatter one string output, re-serializing each payload's elements into
/// the length-prefixed wire form.
pub fn scatter_string_output(
    name: &str,
    tensor: &EngineTensor,
    total_batch_size: usize,
    enable_pinned: bool,
    payloads: &mut [Payload],
    stream: Option<&DeviceStream>,
) -> Result<bool> {
    let (content, offsets) = tensor.string_content()?;
    let element_count = offsets.len() - 1;
    if element_count % total_batch_size != 0 {
        return Err(Status::internal(format!(
            "unexpected element count {element_count} for output '{name}', not divisible by batch size {total_batch_size}"
        )));
    }
    let batch1_element_cnt = element_count / total_batch_size;
    let dims = tensor.dims().to_vec();
    let preferred = if enable_pinned {
        MemoryKind::Pinned
    } else {
        MemoryKind::Pageable
    };

    let mut device_copy = false;
    let mut element_idx = 0usize;
    for payload in payloads.iter_mut() {
        let expected_element_cnt = payload.request.batch_size as usize * batch1_element_cnt;
        let ok = payload.is_ok();
        if let Some(response) = payload.response.as_mut().filter(|r| ok && r.requires_output(name))
        {
            let end_off = *offsets
                .get(element_idx + expected_element_cnt)
                .ok_or_else(|| {
                    Status::internal(format!(
                        "output '{name}' has fewer string elements than the batch requires"
                    ))
                })?;
            let data_byte_size = end_off - offsets[element_idx];
            let expected_byte_size = data_byte_size + 4 * expected_element_cnt;

            match response.allocate_output_buffer(name, expected_byte_size, &dims, preferred, 0) {
                Ok(buffer) => {
                    let mut copied = 0usize;
                    for e in 0..expected_element_cnt {
                        let start = offsets[element_idx + e];
                        let end = offsets[element_idx + e + 1];
                        let len = (end - start) as u32;

                        let prefix = buffer.copy_from(
                            name,
                            MemoryKind::Pageable,
                            0,
                            copied,
                            &len.to_le_bytes(),
                            stream,
                        );
                        match prefix {
                            Ok(enqueued) => device_copy |= enqueued,
                            Err(status) => {
                                payload.set_status(status);
                                break;
                            }
                        }
                        copied += 4;

                        let body = buffer.copy_from(
                            name,
                            MemoryKind::Pageable,
                            0,
                            copied,
                            &content[start..end],
                            stream,
                        );
                        match body {
                            Ok(enqueued) => device_copy |= enqueued,
                            Err(status) => {
                                payload.set_status(status);
                                break;
                            }
                        }
                        copied += end - start;
                    }
                }
                Err(status) => payload.set_status(status),
            }
        }
        element_idx += expected_element_cnt;
    }
    Ok(device_copy)
}

/// Apply deferred output scatters on the stream.
pub fn apply_output_indirect(
    indirects: &[OutputIndirect],
    payloads: &mut [Payload],
    stream: Option<&DeviceStream>,
) -> Result<bool> {
    let mut device_copy = false;
    for indirect in indirects {
        let mut src_offset = 0usize;
        for (payload_idx, dst) in &indirect.targets {
            let byte_size = dst.byte_size();
            let Some(src) = indirect.source.buffer().get(src_offset..src_offset + byte_size)
            else {
                if let Some(payload) = payloads.get_mut(*payload_idx) {
                    payload.set_status(Status::internal(
                        "indirect output buffer is shorter than its targets",
                    ));
                }
                break;
            };
            match dst.copy_from(
                "indirect buffer",
                indirect.source.kind(),
                indirect.source.id(),
                0,
                src,
                stream,
            ) {
                Ok(enqueued) => device_copy |= enqueued,
                Err(status) => {
                    if let Some(payload) = payloads.get_mut(*payload_idx) {
                        payload.set_status(status);
                    }
                }
            }
            src_offset += byte_size;
        }
    }
    Ok(device_copy)
}
