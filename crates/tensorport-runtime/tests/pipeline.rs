//! End-to-end runs: config -> context set -> scheduler -> batched execution
//! against the loopback engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use bytes::Bytes;
use tensorport_core::{
    encode_string_elements, DType, InstanceGroup, InstanceKind, ModelConfig, ModelInput,
    ModelOutput, Status,
};
use tensorport_engine::{Engine, IdentityEngine};
use tensorport_runtime::{
    Batch, InMemoryResponse, InferenceRequest, ModelFile, ModelFileMap, ModelRuntime,
    NoGpuInventory, Payload, RequestInput, StandaloneScheduler, StatSink, TimestampKind,
};

static MANIFEST_SEQ: AtomicUsize = AtomicUsize::new(0);

fn write_manifest(contents: &str) -> PathBuf {
    let seq = MANIFEST_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "tensorport-pipeline-test-{}-{seq}.json",
        std::process::id()
    ));
    std::fs::write(&path, contents).expect("write manifest");
    path
}

fn model_files(manifest: &str) -> ModelFileMap {
    HashMap::from([(
        "model.json".to_string(),
        ModelFile {
            initialized: true,
            path: write_manifest(manifest),
        },
    )])
}

fn base_config(max_batch_size: i32) -> ModelConfig {
    ModelConfig {
        name: "echo".into(),
        max_batch_size,
        instance_group: vec![InstanceGroup {
            name: "group0".into(),
            kind: InstanceKind::Cpu,
            count: 1,
            gpus: vec![],
        }],
        default_model_filename: "model.json".into(),
        ..Default::default()
    }
}

fn f32_input(name: &str, dims: Vec<i64>) -> ModelInput {
    ModelInput {
        name: name.into(),
        data_type: DType::F32,
        dims,
        reshape: None,
    }
}

fn f32_output(name: &str, dims: Vec<i64>) -> ModelOutput {
    ModelOutput {
        name: name.into(),
        data_type: DType::F32,
        dims,
        reshape: None,
    }
}

fn ramp_bytes(count: usize, base: f32) -> Vec<u8> {
    let mut data = Vec::with_capacity(count * 4);
    for i in 0..count {
        data.extend_from_slice(&(base + i as f32).to_le_bytes());
    }
    data
}

fn run_batch(
    scheduler: &StandaloneScheduler,
    payloads: Vec<Payload>,
) -> (Vec<Payload>, Result<(), Status>) {
    let (tx, rx) = mpsc::channel();
    scheduler
        .submit(
            0,
            Batch {
                payloads,
                done: Box::new(move |payloads, result| {
                    tx.send((payloads, result)).unwrap();
                }),
            },
        )
        .unwrap();
    rx.recv().unwrap()
}

#[test]
fn batched_fixed_size_run_round_trips() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "x", "data_type": "f32", "dims": [-1, 4] } ],
            "outputs": [ { "name": "y", "data_type": "f32", "dims": [-1, 4] } ]
        }"#,
    );
    let mut config = base_config(8);
    config.input = vec![f32_input("x", vec![4])];
    config.output = vec![f32_output("y", vec![4])];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();
    assert_eq!(runtime.context_count(), 1);

    let first_data = ramp_bytes(12, 0.0);
    let second_data = ramp_bytes(20, 100.0);
    let first = InMemoryResponse::all();
    let second = InMemoryResponse::all();
    let payloads = vec![
        Payload::new(InferenceRequest::new(3).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![4], Bytes::from(first_data.clone())),
        ))
        .with_response(first.clone())
        .with_stats(StatSink::new()),
        Payload::new(InferenceRequest::new(5).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![4], Bytes::from(second_data.clone())),
        ))
        .with_response(second.clone()),
    ];

    let (payloads, result) = run_batch(&scheduler, payloads);
    result.unwrap();
    assert!(payloads.iter().all(|p| p.is_ok()));

    // Each payload gets exactly its own slice of the batch back.
    let (shape, data) = first.output("y").unwrap();
    assert_eq!(shape, vec![8, 4]);
    assert_eq!(data.as_ref(), &first_data[..]);
    let (_, data) = second.output("y").unwrap();
    assert_eq!(data.as_ref(), &second_data[..]);

    // Stats were stamped along the way.
    let stats = payloads[0].stats.as_ref().unwrap();
    assert!(stats.timestamp(TimestampKind::ComputeInputEnd).is_some());
    assert!(stats.timestamp(TimestampKind::ComputeOutputStart).is_some());
}

#[test]
fn non_batching_model_accepts_exactly_one_request() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "x", "data_type": "f32", "dims": [1, 16] } ],
            "outputs": [ { "name": "y", "data_type": "f32", "dims": [1, 16] } ]
        }"#,
    );
    let mut config = base_config(0);
    config.input = vec![f32_input("x", vec![1, 16])];
    config.output = vec![f32_output("y", vec![1, 16])];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let _runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();

    let data = ramp_bytes(16, 0.0);
    let response = InMemoryResponse::all();
    let payloads = vec![Payload::new(InferenceRequest::new(1).with_input(
        "x",
        RequestInput::contiguous(DType::F32, vec![1, 16], Bytes::from(data.clone())),
    ))
    .with_response(response.clone())];

    let (_, result) = run_batch(&scheduler, payloads);
    result.unwrap();

    let (shape, out) = response.output("y").unwrap();
    // No batch axis is prepended for a non-batching model.
    assert_eq!(shape, vec![1, 16]);
    assert_eq!(out.as_ref(), &data[..]);

    // A second request in the same batch violates the non-batching rule.
    let payloads = vec![
        Payload::new(InferenceRequest::new(1).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![1, 16], Bytes::from(data.clone())),
        )),
        Payload::new(InferenceRequest::new(1).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![1, 16], Bytes::from(data)),
        )),
    ];
    let (payloads, result) = run_batch(&scheduler, payloads);
    let err = result.unwrap_err();
    assert!(matches!(err, Status::Internal(_)));
    assert!(payloads.iter().all(|p| !p.is_ok()));
}

#[test]
fn string_round_trip_reproduces_the_wire_bytes() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "s", "data_type": "string", "dims": [-1, 3] } ],
            "outputs": [ { "name": "t", "data_type": "string", "dims": [-1, 3] } ]
        }"#,
    );
    let mut config = base_config(4);
    config.input = vec![ModelInput {
        name: "s".into(),
        data_type: DType::String,
        dims: vec![3],
        reshape: None,
    }];
    config.output = vec![ModelOutput {
        name: "t".into(),
        data_type: DType::String,
        dims: vec![3],
        reshape: None,
    }];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let _runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();

    let wire = encode_string_elements(["abcd".as_bytes(), b"", b"xy"]);
    let declared = wire.len() as u64;
    let mut input = RequestInput::contiguous(DType::String, vec![3], wire.clone());
    input.batch_byte_size = declared;

    let response = InMemoryResponse::all();
    let payloads = vec![Payload::new(InferenceRequest::new(1).with_input("s", input))
        .with_response(response.clone())];

    let (_, result) = run_batch(&scheduler, payloads);
    result.unwrap();

    let (_, out) = response.output("t").unwrap();
    assert_eq!(out, wire);
}

#[test]
fn truncated_string_payload_fails_alone() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "s", "data_type": "string", "dims": [-1, 1] } ],
            "outputs": [ { "name": "t", "data_type": "string", "dims": [-1, 1] } ]
        }"#,
    );
    let mut config = base_config(4);
    config.input = vec![ModelInput {
        name: "s".into(),
        data_type: DType::String,
        dims: vec![1],
        reshape: None,
    }];
    config.output = vec![ModelOutput {
        name: "t".into(),
        data_type: DType::String,
        dims: vec![1],
        reshape: None,
    }];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let _runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();

    let good_wire = encode_string_elements([b"hello" as &[u8]]);
    let good_len = good_wire.len() as u64;
    let mut good_input = RequestInput::contiguous(DType::String, vec![1], good_wire.clone());
    good_input.batch_byte_size = good_len;

    // Declares 12 bytes but only carries a truncated element.
    let mut bad_input = RequestInput::contiguous(
        DType::String,
        vec![1],
        Bytes::from_static(&[8, 0, 0, 0, b'a', b'b']),
    );
    bad_input.batch_byte_size = 12;

    let good_response = InMemoryResponse::all();
    let bad_response = InMemoryResponse::all();
    let payloads = vec![
        Payload::new(InferenceRequest::new(1).with_input("s", good_input))
            .with_response(good_response.clone()),
        Payload::new(InferenceRequest::new(1).with_input("s", bad_input))
            .with_response(bad_response.clone()),
    ];

    let (payloads, result) = run_batch(&scheduler, payloads);
    // The batch as a whole still succeeds.
    result.unwrap();

    assert!(payloads[0].is_ok());
    let err = payloads[1].status.clone().unwrap_err();
    assert!(matches!(err, Status::InvalidArg(_)));
    assert!(err.to_string().contains("incomplete string data"));

    let (_, out) = good_response.output("t").unwrap();
    assert_eq!(out, good_wire);
    // The failed payload got no string output.
    assert!(bad_response.output("t").is_none());
}

#[test]
fn validator_rejects_rank_mismatch_and_stores_no_context() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "x", "data_type": "i32", "dims": [3, 4] } ],
            "outputs": [ { "name": "y", "data_type": "i32", "dims": [3, 4, 5] } ]
        }"#,
    );
    let mut config = base_config(0);
    config.input = vec![ModelInput {
        name: "x".into(),
        data_type: DType::I32,
        dims: vec![3, 4],
        reshape: None,
    }];
    config.output = vec![ModelOutput {
        name: "y".into(),
        data_type: DType::I32,
        dims: vec![3, 4],
        reshape: None,
    }];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let err = ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler)
        .unwrap_err();
    assert!(matches!(err, Status::InvalidArg(_)));
    // The build aborted before any runner was registered.
    assert_eq!(scheduler.runner_count(), 0);
}

#[test]
fn each_instance_gets_its_own_runner() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "x", "data_type": "f32", "dims": [-1, 2] } ],
            "outputs": [ { "name": "y", "data_type": "f32", "dims": [-1, 2] } ]
        }"#,
    );
    let mut config = base_config(4);
    config.input = vec![f32_input("x", vec![2])];
    config.output = vec![f32_output("y", vec![2])];
    config.instance_group = vec![
        InstanceGroup {
            name: "a".into(),
            kind: InstanceKind::Cpu,
            count: 2,
            gpus: vec![],
        },
        InstanceGroup {
            name: "b".into(),
            kind: InstanceKind::Cpu,
            count: 1,
            gpus: vec![],
        },
    ];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();

    assert_eq!(runtime.context_count(), 3);
    assert_eq!(scheduler.runner_count(), 3);

    let names: Vec<String> = runtime
        .instances()
        .iter()
        .map(|i| i.name.clone())
        .collect();
    assert_eq!(names, vec!["a_0_cpu", "a_1_cpu", "b_0_cpu"]);

    // Every runner executes against its own context.
    for runner_idx in 0..3 {
        let response = InMemoryResponse::all();
        let data = ramp_bytes(2, runner_idx as f32);
        let (tx, rx) = mpsc::channel();
        scheduler
            .submit(
                runner_idx,
                Batch {
                    payloads: vec![Payload::new(InferenceRequest::new(1).with_input(
                        "x",
                        RequestInput::contiguous(DType::F32, vec![2], Bytes::from(data.clone())),
                    ))
                    .with_response(response.clone())],
                    done: Box::new(move |payloads, result| {
                        tx.send((payloads, result)).unwrap();
                    }),
                },
            )
            .unwrap();
        let (_, result) = rx.recv().unwrap();
        result.unwrap();
        assert_eq!(response.output("y").unwrap().1.as_ref(), &data[..]);
    }
}

#[test]
fn engine_failure_stamps_every_payload_as_internal() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "x", "data_type": "f32", "dims": [-1, 2] } ],
            "outputs": [ { "name": "y", "data_type": "f32", "dims": [-1, 2] } ],
            "fail_run": true
        }"#,
    );
    let mut config = base_config(4);
    config.input = vec![f32_input("x", vec![2])];
    config.output = vec![f32_output("y", vec![2])];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let _runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();

    let payloads = vec![
        Payload::new(InferenceRequest::new(1).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![2], Bytes::from(ramp_bytes(2, 0.0))),
        )),
        Payload::new(InferenceRequest::new(2).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![2], Bytes::from(ramp_bytes(4, 0.0))),
        )),
    ];

    let (payloads, result) = run_batch(&scheduler, payloads);
    let err = result.unwrap_err();
    // The engine error crossed the scheduler boundary as internal.
    assert!(matches!(err, Status::Internal(_)));
    for payload in &payloads {
        assert_eq!(payload.status.clone().unwrap_err(), err);
    }
}

#[test]
fn pinned_memory_staging_round_trips() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "x", "data_type": "f32", "dims": [-1, 4] } ],
            "outputs": [ { "name": "y", "data_type": "f32", "dims": [-1, 4] } ]
        }"#,
    );
    let mut config = base_config(8);
    config.input = vec![f32_input("x", vec![4])];
    config.output = vec![f32_output("y", vec![4])];
    // Route both directions through the pinned staging buffers and their
    // deferred gather/scatter copies.
    config.optimization.input_pinned_memory = true;
    config.optimization.output_pinned_memory = true;

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let _runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();

    let first_data = ramp_bytes(8, 1.0);
    let second_data = ramp_bytes(4, 200.0);
    let first = InMemoryResponse::all();
    let second = InMemoryResponse::all();
    let payloads = vec![
        Payload::new(InferenceRequest::new(2).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![4], Bytes::from(first_data.clone())),
        ))
        .with_response(first.clone()),
        Payload::new(InferenceRequest::new(1).with_input(
            "x",
            RequestInput::contiguous(DType::F32, vec![4], Bytes::from(second_data.clone())),
        ))
        .with_response(second.clone()),
    ];

    let (payloads, result) = run_batch(&scheduler, payloads);
    result.unwrap();
    assert!(payloads.iter().all(|p| p.is_ok()));

    assert_eq!(first.output("y").unwrap().1.as_ref(), &first_data[..]);
    assert_eq!(second.output("y").unwrap().1.as_ref(), &second_data[..]);
}

#[test]
fn sequence_controls_count_toward_the_expected_inputs() {
    let files = model_files(
        r#"{
            "inputs": [
                { "name": "x", "data_type": "f32", "dims": [-1, 2] },
                { "name": "START", "data_type": "i32", "dims": [-1, 1] },
                { "name": "READY", "data_type": "i32", "dims": [-1, 1] }
            ],
            "outputs": [ { "name": "y", "data_type": "f32", "dims": [-1, 2] } ]
        }"#,
    );
    let mut config = base_config(4);
    config.input = vec![f32_input("x", vec![2])];
    config.output = vec![f32_output("y", vec![2])];
    config.sequence_batching = Some(tensorport_core::SequenceBatching {
        control_input: vec![
            tensorport_core::ControlInput {
                name: "START".into(),
                kind: tensorport_core::ControlKind::SequenceStart,
                data_type: DType::I32,
            },
            tensorport_core::ControlInput {
                name: "READY".into(),
                kind: tensorport_core::ControlKind::SequenceReady,
                data_type: DType::I32,
            },
        ],
    });

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    // One declared input + two enabled controls = the session's three inputs.
    ModelRuntime::create(
        config.clone(),
        &files,
        &engine,
        &NoGpuInventory,
        &mut scheduler,
    )
    .unwrap();

    // A control with the wrong shape is rejected at build time.
    let bad_files = model_files(
        r#"{
            "inputs": [
                { "name": "x", "data_type": "f32", "dims": [-1, 2] },
                { "name": "START", "data_type": "i32", "dims": [-1, 2] },
                { "name": "READY", "data_type": "i32", "dims": [-1, 1] }
            ],
            "outputs": [ { "name": "y", "data_type": "f32", "dims": [-1, 2] } ]
        }"#,
    );
    let mut scheduler = StandaloneScheduler::new();
    let err = ModelRuntime::create(config, &bad_files, &engine, &NoGpuInventory, &mut scheduler)
        .unwrap_err();
    assert!(matches!(err, Status::InvalidArg(_)));
    assert!(err.to_string().contains("dims [1] is expected"));
}

#[test]
fn name_aliases_remap_config_names_to_session_names() {
    let files = model_files(
        r#"{
            "inputs": [ { "name": "serving_x:0", "data_type": "f32", "dims": [-1, 2] } ],
            "outputs": [ { "name": "partitioned_call:0", "data_type": "f32", "dims": [-1, 2] } ],
            "input_aliases": { "x": "serving_x:0" },
            "output_aliases": { "y": "partitioned_call:0" }
        }"#,
    );
    let mut config = base_config(4);
    config.input = vec![f32_input("x", vec![2])];
    config.output = vec![f32_output("y", vec![2])];

    let engine = Engine::Identity(IdentityEngine::new());
    let mut scheduler = StandaloneScheduler::new();
    let _runtime =
        ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler).unwrap();

    let data = ramp_bytes(2, 7.0);
    let response = InMemoryResponse::all();
    let payloads = vec![Payload::new(InferenceRequest::new(1).with_input(
        "x",
        RequestInput::contiguous(DType::F32, vec![2], Bytes::from(data.clone())),
    ))
    .with_response(response.clone())];

    let (_, result) = run_batch(&scheduler, payloads);
    result.unwrap();

    // Outputs come back under the configured name.
    assert_eq!(response.output("y").unwrap().1.as_ref(), &data[..]);
}
