//! Signature checks between a loaded session and the model configuration.

use std::collections::HashMap;

use tensorport_core::{
    dims_to_string, ControlKind, DType, ModelConfig, Result, SequenceBatching, Status, TensorInfo,
};

/// Datatypes a boolean sequence-control tensor may declare.
const BOOLEAN_CONTROL_TYPES: &[DType] = &[DType::Bool, DType::I32, DType::F32];
/// Datatypes the typed (correlation-id) control may declare.
const TYPED_CONTROL_TYPES: &[DType] = &[DType::U64, DType::I64, DType::U32, DType::I32];

/// Shape compatibility between an engine-reported shape and configured dims.
///
/// Engine dims of `-1` are dynamic and match any configured value. When the
/// model supports batching, the engine shape carries a leading batch axis
/// that is not compared. Outputs are compared exactly; inputs may have more
/// dims than configured as long as the trailing engine dims are fully
/// specified.
pub fn compare_dims_supported(
    model_name: &str,
    io_name: &str,
    model_dims: &[i64],
    config_dims: &[i64],
    max_batch_size: i32,
    compare_exact: bool,
) -> Result<()> {
    let batch_offset = usize::from(max_batch_size > 0);
    if model_dims.len() < batch_offset {
        return Err(Status::invalid_arg(format!(
            "unable to load model '{model_name}', tensor '{io_name}' has no batch dimension, model shape is {}",
            dims_to_string(model_dims)
        )));
    }
    let debatched = &model_dims[batch_offset..];

    let rank_mismatch = if compare_exact {
        debatched.len() != config_dims.len()
    } else {
        debatched.len() < config_dims.len()
    };
    if rank_mismatch {
        return Err(Status::invalid_arg(format!(
            "unable to load model '{model_name}', tensor '{io_name}': the model expects {} dimensions (shape {}) but the model configuration specifies {} dimensions (shape {})",
            debatched.len(),
            dims_to_string(debatched),
            config_dims.len(),
            dims_to_string(config_dims)
        )));
    }

    for (idx, &config_dim) in config_dims.iter().enumerate() {
        let model_dim = debatched[idx];
        if model_dim != -1 && model_dim != config_dim {
            return Err(Status::invalid_arg(format!(
                "unable to load model '{model_name}', tensor '{io_name}': the model expects shape {} but the model configuration specifies shape {}",
                dims_to_string(debatched),
                dims_to_string(config_dims)
            )));
        }
    }

    if !compare_exact {
        for &trailing in &debatched[config_dims.len()..] {
            if trailing == -1 {
                return Err(Status::invalid_arg(format!(
                    "unable to load model '{model_name}', tensor '{io_name}': trailing model dimensions beyond the configured shape {} must be fully specified, model shape is {}",
                    dims_to_string(config_dims),
                    dims_to_string(debatched)
                )));
            }
        }
    }

    Ok(())
}

fn resolve<'a>(name_map: &'a HashMap<String, String>, name: &'a str) -> &'a str {
    name_map.get(name).map(String::as_str).unwrap_or(name)
}

/// Check declared inputs against the session's discovered inputs.
///
/// `expected_input_cnt` is the declared input count plus one per enabled
/// sequence control.
pub fn validate_inputs(
    model_name: &str,
    config: &ModelConfig,
    session_input_infos: &HashMap<String, TensorInfo>,
    name_map: &HashMap<String, String>,
    expected_input_cnt: usize,
) -> Result<()> {
    if session_input_infos.len() != expected_input_cnt {
        return Err(Status::invalid_arg(format!(
            "unable to load model '{model_name}', configuration expects {expected_input_cnt} inputs, model provides {}",
            session_input_infos.len()
        )));
    }

    for io in &config.input {
        let session_name = resolve(name_map, &io.name);
        let Some(info) = session_input_infos.get(session_name) else {
            if config.allowed_input_names.iter().any(|n| n == &io.name) {
                continue;
            }
            let mut known: Vec<&str> = session_input_infos.keys().map(String::as_str).collect();
            known.sort_unstable();
            return Err(Status::invalid_arg(format!(
                "unexpected inference input '{}' for model '{model_name}', allowed inputs are: {}",
                io.name,
                known.join(", ")
            )));
        };

        if info.dtype != io.data_type {
            return Err(Status::invalid_arg(format!(
                "unable to load model '{model_name}', unexpected datatype {} for input '{}', expecting {}",
                info.dtype, io.name, io.data_type
            )));
        }

        let dims = io.reshape.as_deref().unwrap_or(&io.dims);
        compare_dims_supported(
            model_name,
            &io.name,
            &info.dims,
            dims,
            config.max_batch_size,
            false,
        )?;
    }

    Ok(())
}

/// Check declared outputs against the session's discovered outputs. Output
/// shapes are compared exactly.
pub fn validate_outputs(
    model_name: &str,
    config: &ModelConfig,
    session_output_infos: &HashMap<String, TensorInfo>,
    name_map: &HashMap<String, String>,
) -> Result<()> {
    for io in &config.output {
        let session_name = resolve(name_map, &io.name);
        let Some(info) = session_output_infos.get(session_name) else {
            if config.allowed_output_names.iter().any(|n| n == &io.name) {
                continue;
            }
            let mut known: Vec<&str> = session_output_infos.keys().map(String::as_str).collect();
            known.sort_unstable();
            return Err(Status::invalid_arg(format!(
                "unexpected inference output '{}' for model '{model_name}', allowed outputs are: {}",
                io.name,
                known.join(", ")
            )));
        };

        if info.dtype != io.data_type {
            return Err(Status::invalid_arg(format!(
                "unable to load model '{model_name}', unexpected datatype {} for output '{}', expecting {}",
                info.dtype, io.name, io.data_type
            )));
        }

        let dims = io.reshape.as_deref().unwrap_or(&io.dims);
        compare_dims_supported(
            model_name,
            &io.name,
            &info.dims,
            dims,
            config.max_batch_size,
            true,
        )?;
    }

    Ok(())
}

/// Validate one sequence-control tensor if the configuration declares it.
///
/// Control tensors must have debatched shape exactly `[1]` and the declared
/// datatype. Returns whether the control is present (and therefore counts
/// toward the expected input count).
pub fn validate_sequence_control(
    model_name: &str,
    batching: &SequenceBatching,
    kind: ControlKind,
    session_input_infos: &HashMap<String, TensorInfo>,
    name_map: &HashMap<String, String>,
    max_batch_size: i32,
) -> Result<bool> {
    let Some(control) = batching.control(kind) else {
        return Ok(false);
    };

    let allowed: &[DType] = if kind.is_typed() {
        TYPED_CONTROL_TYPES
    } else {
        BOOLEAN_CONTROL_TYPES
    };
    if !allowed.contains(&control.data_type) {
        return Err(Status::invalid_arg(format!(
            "unable to load model '{model_name}', sequence control '{}' specifies datatype {} which is not valid for {:?}",
            control.name, control.data_type, kind
        )));
    }

    let session_name = resolve(name_map, &control.name);
    let Some(info) = session_input_infos.get(session_name) else {
        return Err(Status::internal(format!(
            "configuration specified sequence control '{}', but model does not provide that input",
            control.name
        )));
    };

    let batch_offset = usize::from(max_batch_size > 0).min(info.dims.len());
    let debatched = &info.dims[batch_offset..];
    if debatched != [1] {
        return Err(Status::invalid_arg(format!(
            "unable to load model '{model_name}', sequence control '{}' in model has dims {} but dims [1] is expected",
            control.name,
            dims_to_string(debatched)
        )));
    }

    if info.dtype != control.data_type {
        return Err(Status::invalid_arg(format!(
            "unable to load model '{model_name}', sequence control '{}', the model expects data-type {} but the model configuration specifies data-type {}",
            control.name, info.dtype, control.data_type
        )));
    }

    Ok(true)
}
