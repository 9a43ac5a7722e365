//! Per-epoch sweeps of the motion stream
//!
//! [`EpochTrainer`] runs one parameter-updating pass over the training
//! stream; [`EpochValidator`] runs one forward-only pass over the validation
//! stream and scores it per video.

pub mod epoch_trainer;
pub mod epoch_validator;

#[cfg(test)]
mod tests;

pub use epoch_trainer::EpochTrainer;
pub use epoch_validator::{EpochValidator, ValidationOutcome};

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

/// Check that `logits` is `[N, num_classes]` and every one of the `N` labels
/// is a valid class index
pub(crate) fn check_logits(logits: &Tensor, labels: &Tensor, num_classes: usize) -> Result<()> {
    let dims = logits.dims();
    if dims.len() != 2 || dims[1] != num_classes {
        return Err(Error::shape_mismatch(format!(
            "expected logits of shape [N, {}], got {:?}",
            num_classes, dims
        )));
    }
    if labels.dims() != [dims[0]] {
        return Err(Error::shape_mismatch(format!(
            "logits {:?} do not match labels {:?}",
            dims,
            labels.dims()
        )));
    }

    let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    if let Some(bad) = labels.iter().find(|&&label| label as usize >= num_classes) {
        return Err(Error::shape_mismatch(format!(
            "label {} is out of range for {} classes",
            bad, num_classes
        )));
    }
    Ok(())
}
