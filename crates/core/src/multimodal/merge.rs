//! Collapses runs of adjacent image placeholders into one fused Input.

use std::hash::Hasher;

use fnv::FnvHasher;
use tracing::debug;

use super::input::Input;
use crate::error::ModelError;

/// FNV-1a 64 of a byte buffer. Used as the image content fingerprint.
pub fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Fold `next` into `running`: fresh FNV-1a state fed the native-endian
/// bytes of `running`, then of `next`. Order sensitive.
pub fn combine_hashes(running: u64, next: u64) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(&running.to_ne_bytes());
    hasher.write(&next.to_ne_bytes());
    hasher.finish()
}

/// Merge every run of consecutive placeholders into its first member.
///
/// The survivor keeps the run's position, carries the payloads concatenated
/// along the image axis in run order and the folded fingerprint. Runs of
/// one and text Inputs pass through untouched.
pub fn merge_placeholders(mut inputs: Vec<Input>) -> Result<Vec<Input>, ModelError> {
    let mut run_start: Option<usize> = None;
    // indices of run members folded into their target
    let mut removed = vec![false; inputs.len()];
    let mut fused_runs = 0usize;

    for i in 0..=inputs.len() {
        let in_run = inputs.get(i).is_some_and(Input::is_placeholder);
        match (run_start, in_run) {
            (None, true) => run_start = Some(i),
            (Some(start), false) => {
                if i - start > 1 {
                    fuse_run(&mut inputs[start..i])?;
                    removed[start + 1..i].fill(true);
                    fused_runs += 1;
                }
                run_start = None;
            }
            _ => {}
        }
    }

    if fused_runs > 0 {
        let mut removed = removed.into_iter();
        inputs.retain(|_| !removed.next().unwrap_or(false));
    }
    Ok(inputs)
}

fn fuse_run(run: &mut [Input]) -> Result<(), ModelError> {
    let (target, rest) = match run.split_first_mut() {
        Some(split) => split,
        None => return Ok(()),
    };
    let Some(mut payload) = target.multimodal.take() else {
        return Ok(());
    };
    let mut hash = target.multimodal_hash;

    for member in rest.iter_mut() {
        if let Some(next) = member.multimodal.take() {
            payload = payload.concat(&next)?;
            hash = combine_hashes(hash, member.multimodal_hash);
        }
        member.token = Input::DELETED;
    }

    debug!(
        images = payload.num_images(),
        fingerprint = hash,
        "fused placeholder run"
    );
    target.multimodal = Some(payload);
    target.multimodal_hash = hash;
    Ok(())
}
