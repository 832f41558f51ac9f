use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tensorport_core::DType;
use tensorport_engine::{Engine, EngineTensor, IdentityEngine, SessionOptions};

static MANIFEST_SEQ: AtomicUsize = AtomicUsize::new(0);

fn write_manifest(contents: &str) -> PathBuf {
    let seq = MANIFEST_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "tensorport-engine-test-{}-{seq}.json",
        std::process::id()
    ));
    std::fs::write(&path, contents).expect("write manifest");
    path
}

#[test]
fn identity_session_echoes_through_manifest() {
    let path = write_manifest(
        r#"{
            "inputs": [
                { "name": "x", "data_type": "f32", "dims": [-1, 4] }
            ],
            "outputs": [
                { "name": "y", "data_type": "f32", "dims": [-1, 4] }
            ]
        }"#,
    );

    let engine = Engine::Identity(IdentityEngine::new());
    let options = SessionOptions::default();
    assert!(engine.session_create_is_thread_safe(&options));

    let mut session = engine.load(&path, &options).expect("load identity session");
    assert_eq!(session.input_names(), vec!["x".to_string()]);
    assert_eq!(session.output_names(), vec!["y".to_string()]);

    let infos = session.input_infos().unwrap();
    assert_eq!(infos["x"].dtype, DType::F32);
    assert_eq!(infos["x"].dims, vec![-1, 4]);

    let data: Vec<u8> = (0..32).collect();
    let input =
        EngineTensor::from_buffer(DType::F32, vec![2, 4], Bytes::from(data.clone())).unwrap();
    let outputs = session
        .run(&["x".into()], &[input], &["y".into()])
        .unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].data().unwrap().as_ref(), &data[..]);

    std::fs::remove_file(path).ok();
}

#[test]
fn manifest_aliases_surface_as_name_maps() {
    let path = write_manifest(
        r#"{
            "inputs": [
                { "name": "serving_default_x:0", "data_type": "i32", "dims": [1] }
            ],
            "outputs": [
                { "name": "StatefulPartitionedCall:0", "data_type": "i32", "dims": [1] }
            ],
            "input_aliases": { "x": "serving_default_x:0" },
            "output_aliases": { "y": "StatefulPartitionedCall:0" }
        }"#,
    );

    let engine = Engine::Identity(IdentityEngine::new());
    let session = engine.load(&path, &SessionOptions::default()).unwrap();

    assert_eq!(
        session.input_name_map().get("x"),
        Some(&"serving_default_x:0".to_string())
    );
    assert_eq!(
        session.output_name_map().get("y"),
        Some(&"StatefulPartitionedCall:0".to_string())
    );

    std::fs::remove_file(path).ok();
}

#[test]
fn serialized_load_engines_report_thread_unsafe_creation() {
    let engine = Engine::Identity(IdentityEngine::with_serialized_loads());
    assert!(!engine.session_create_is_thread_safe(&SessionOptions::default()));
}

#[test]
fn missing_manifest_is_internal_error() {
    let engine = Engine::Identity(IdentityEngine::new());
    let err = engine
        .load(
            std::path::Path::new("/nonexistent/model.json"),
            &SessionOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, tensorport_core::Status::Internal(_)));
}
