//! Weight import from safetensors files
//!
//! Tensors are matched to model variables by name. A matching shape is copied
//! as is. A 4-d kernel that differs only in its input-channel count (an RGB
//! stem loaded into the flow network) is averaged over the input channels
//! and replicated to the flow channel count. Everything else is skipped.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::{debug, warn};

use super::Pretraining;
use crate::error::{Error, Result};

/// What an import did with each model variable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Copied unchanged
    pub copied: Vec<String>,
    /// Kernels adapted across input modalities
    pub adapted: Vec<String>,
    /// Present in the source but incompatible
    pub skipped: Vec<String>,
    /// Model variables absent from the source
    pub missing: Vec<String>,
}

/// Import the weights selected by `pretraining` into `var_map`
///
/// Returns `None` for [`Pretraining::NoPretrain`].
pub fn import_weights(
    var_map: &VarMap,
    pretraining: &Pretraining,
    device: &Device,
) -> Result<Option<ImportReport>> {
    let Some(path) = pretraining.weights_path() else {
        return Ok(None);
    };
    if !path.is_file() {
        return Err(Error::config(format!(
            "{} weights file {} does not exist",
            pretraining.label(),
            path.display()
        )));
    }
    let report = import_file(var_map, path, device)?;
    Ok(Some(report))
}

/// Import every compatible tensor of a safetensors file
pub fn import_file(var_map: &VarMap, path: &Path, device: &Device) -> Result<ImportReport> {
    let tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| Error::model(format!("cannot read weights {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), tensors = tensors.len(), "Loaded weights file");
    import_tensors(var_map, &tensors)
}

/// Copy or adapt every compatible tensor of `source` into `var_map`
pub fn import_tensors(var_map: &VarMap, source: &HashMap<String, Tensor>) -> Result<ImportReport> {
    let vars = var_map
        .data()
        .lock()
        .map_err(|_| Error::internal("parameter map lock poisoned"))?;

    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let mut report = ImportReport::default();
    for name in names {
        let var = &vars[name];
        let Some(tensor) = source.get(name) else {
            report.missing.push(name.clone());
            continue;
        };

        if tensor.dims() == var.dims() {
            var.set(&tensor.to_dtype(var.dtype())?)?;
            report.copied.push(name.clone());
        } else if let Some(adapted) = adapt_input_channels(tensor, var.dims())? {
            var.set(&adapted.to_dtype(var.dtype())?)?;
            report.adapted.push(name.clone());
        } else {
            warn!(
                parameter = %name,
                source_shape = ?tensor.dims(),
                model_shape = ?var.dims(),
                "Skipping pretrained tensor with incompatible shape"
            );
            report.skipped.push(name.clone());
        }
    }

    if !report.missing.is_empty() {
        debug!(missing = report.missing.len(), "Model variables kept at initialisation");
    }
    Ok(report)
}

/// Average a `[out, in, kh, kw]` kernel over `in` and repeat it to the target
/// input-channel count; `None` when the shapes differ in any other dimension
fn adapt_input_channels(kernel: &Tensor, target: &[usize]) -> Result<Option<Tensor>> {
    let source = kernel.dims();
    if source.len() != 4 || target.len() != 4 {
        return Ok(None);
    }
    if source[0] != target[0] || source[2] != target[2] || source[3] != target[3] {
        return Ok(None);
    }

    let mean = kernel.mean_keepdim(1)?;
    let adapted = mean.repeat((1, target[1], 1, 1))?;
    Ok(Some(adapted))
}
