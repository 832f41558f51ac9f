mod cli;

use std::path::Path;
use std::sync::mpsc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use tensorport_core::{element_count, encode_string_elements, DType, ModelConfig, NO_BATCHING};
use tensorport_engine::{Engine, IdentityEngine, PlanEngine};
use tensorport_runtime::{
    Batch, InMemoryResponse, InferenceRequest, ModelFile, ModelFileMap, ModelRuntime,
    NoGpuInventory, Payload, RequestInput, StandaloneScheduler, StatSink, TimestampKind,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect {
            config,
            model_dir,
            engine,
            log,
        } => {
            init_logging(&log);
            inspect(&config, &model_dir, &engine)
        }
        Command::Run {
            config,
            model_dir,
            engine,
            batch,
            log,
        } => {
            init_logging(&log);
            run(&config, &model_dir, &engine, batch)
        }
    }
}

fn init_logging(log: &str) {
    std::env::set_var("RUST_LOG", log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn parse_engine(raw: &str) -> Result<Engine> {
    match raw {
        "identity" => Ok(Engine::Identity(IdentityEngine::new())),
        "plan" => Ok(Engine::Plan(PlanEngine::new())),
        other => bail!("unsupported engine: {other} (expected identity or plan)"),
    }
}

fn load_config(path: &Path) -> Result<ModelConfig> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read config '{}'", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse config '{}'", path.display()))
}

fn scan_model_dir(dir: &Path) -> Result<ModelFileMap> {
    let mut files = ModelFileMap::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read model directory '{}'", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.insert(
                entry.file_name().to_string_lossy().into_owned(),
                ModelFile {
                    initialized: true,
                    path: entry.path(),
                },
            );
        }
    }
    Ok(files)
}

fn inspect(config_path: &Path, model_dir: &Path, engine: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let files = scan_model_dir(model_dir)?;
    let engine = parse_engine(engine)?;

    let mut scheduler = StandaloneScheduler::new();
    let runtime = ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler)?;

    println!("model: {}", runtime.name());
    let config = runtime.config();
    println!(
        "max_batch_size: {}",
        if config.max_batch_size == NO_BATCHING {
            "<none>".to_string()
        } else {
            config.max_batch_size.to_string()
        }
    );
    for input in &config.input {
        println!(
            "input:  {} {} {}",
            input.name,
            input.data_type,
            tensorport_core::dims_to_string(&input.dims)
        );
    }
    for output in &config.output {
        println!(
            "output: {} {} {}",
            output.name,
            output.data_type,
            tensorport_core::dims_to_string(&output.dims)
        );
    }
    println!("instances:");
    for instance in runtime.instances() {
        println!("  {} on {}", instance.name, instance.device);
    }
    Ok(())
}

fn synthetic_input(dtype: DType, dims: &[i64], batch: u32) -> Result<RequestInput> {
    let per_request = element_count(dims).with_context(|| {
        format!(
            "input shape {} has dynamic dims; a concrete shape is required",
            tensorport_core::dims_to_string(dims)
        )
    })?;
    let elements = per_request as usize * batch.max(1) as usize;

    let mut input = if dtype.is_string() {
        let strings: Vec<String> = (0..elements).map(|i| format!("elem-{i}")).collect();
        let wire = encode_string_elements(strings.iter().map(|s| s.as_bytes()));
        RequestInput::contiguous(dtype, dims.to_vec(), wire)
    } else {
        let byte_size = dtype
            .byte_size()
            .context("unsupported synthetic input datatype")?;
        let data: Vec<u8> = (0..elements * byte_size).map(|i| (i % 251) as u8).collect();
        RequestInput::contiguous(dtype, dims.to_vec(), Bytes::from(data))
    };
    input.batch_byte_size = input.total_content_bytes() as u64;
    Ok(input)
}

fn run(config_path: &Path, model_dir: &Path, engine: &str, batch: u32) -> Result<()> {
    let config = load_config(config_path)?;
    let files = scan_model_dir(model_dir)?;
    let engine = parse_engine(engine)?;

    let mut scheduler = StandaloneScheduler::new();
    let runtime = ModelRuntime::create(config, &files, &engine, &NoGpuInventory, &mut scheduler)?;
    if runtime.context_count() == 0 {
        bail!("config declares no instance groups; nothing to run");
    }

    let config = runtime.config();
    let batch = if config.max_batch_size <= NO_BATCHING {
        1
    } else {
        batch.clamp(1, config.max_batch_size as u32)
    };

    let mut request = InferenceRequest::new(batch);
    for input in &config.input {
        request = request.with_input(
            input.name.clone(),
            synthetic_input(input.data_type, &input.dims, batch)?,
        );
    }

    let response = InMemoryResponse::all();
    let stats = StatSink::new();
    let payload = Payload::new(request)
        .with_response(response.clone())
        .with_stats(stats.clone());

    tracing::info!(model = %runtime.name(), batch, "submitting synthetic batch");

    let (tx, rx) = mpsc::channel();
    scheduler.submit(
        0,
        Batch {
            payloads: vec![payload],
            done: Box::new(move |payloads, result| {
                let _ = tx.send((payloads, result));
            }),
        },
    )?;
    let (payloads, result) = rx.recv().context("runner dropped the batch")?;
    result.context("batch execution failed")?;
    for payload in &payloads {
        payload
            .status
            .clone()
            .context("payload finished with an error status")?;
    }

    println!("ran '{}' with batch size {batch}", runtime.name());
    for output in &config.output {
        match response.output(&output.name) {
            Some((shape, data)) => println!(
                "output {} {} {} ({} bytes)",
                output.name,
                output.data_type,
                tensorport_core::dims_to_string(&shape),
                data.len()
            ),
            None => println!("output {} was not produced", output.name),
        }
    }

    if let (Some(start), Some(input_end), Some(output_start), Some(end)) = (
        stats.timestamp(TimestampKind::ComputeStart),
        stats.timestamp(TimestampKind::ComputeInputEnd),
        stats.timestamp(TimestampKind::ComputeOutputStart),
        stats.timestamp(TimestampKind::ComputeEnd),
    ) {
        println!(
            "timing: stage {}us, engine {}us, scatter {}us",
            input_end.duration_since(start).as_micros(),
            output_start.duration_since(input_end).as_micros(),
            end.duration_since(output_start).as_micros()
        );
    }

    Ok(())
}
