use rayon::prelude::*;
use std::path::Path;

use crate::config::MIN_BINARY_SIZE;
use crate::error::{Result, UpdateError};
use crate::util;

/// Bytes scanned per parallel search window.
const SEARCH_WINDOW: usize = 4 * 1024 * 1024;

/// Heuristic integrity check of a reconstructed executable.
///
/// Checks, in order: the file exists, it is at least `min_size` bytes, it
/// contains the version marker (`1.4.0` -> `140`), and, if an expected
/// BLAKE3 hash is set, that the hash matches. Only the hash step catches
/// subtle corruption; the rest just rules out gross failures.
#[derive(Debug, Clone)]
pub struct Verifier {
    marker: Vec<u8>,
    min_size: u64,
    expected_hash: Option<[u8; 32]>,
}

impl Verifier {
    pub fn new(target_version: &str) -> Self {
        Self {
            marker: version_marker(target_version),
            min_size: MIN_BINARY_SIZE,
            expected_hash: None,
        }
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_expected_hash(mut self, hash: Option<[u8; 32]>) -> Self {
        self.expected_hash = hash;
        self
    }

    /// Run every check, returning the first failure as `VerificationFailed`.
    pub fn check(&self, candidate: &Path) -> Result<()> {
        let meta = std::fs::metadata(candidate).map_err(|_| {
            UpdateError::VerificationFailed(format!("{} does not exist", candidate.display()))
        })?;
        if !meta.is_file() {
            return Err(UpdateError::VerificationFailed(format!(
                "{} is not a regular file",
                candidate.display()
            )));
        }
        if meta.len() < self.min_size {
            return Err(UpdateError::VerificationFailed(format!(
                "{} is {} bytes, below the {} byte floor",
                candidate.display(),
                meta.len(),
                self.min_size
            )));
        }
        if self.marker.is_empty() {
            return Err(UpdateError::VerificationFailed(
                "target version yields an empty marker".into(),
            ));
        }

        let data = util::mmap_file(candidate)?;
        if !contains_marker(&data, &self.marker) {
            return Err(UpdateError::VerificationFailed(format!(
                "version marker {:?} not found in {}",
                String::from_utf8_lossy(&self.marker),
                candidate.display()
            )));
        }

        if let Some(expected) = self.expected_hash {
            if util::hash_bytes(&data) != expected {
                return Err(UpdateError::VerificationFailed(format!(
                    "BLAKE3 mismatch for {}",
                    candidate.display()
                )));
            }
        }

        Ok(())
    }
}

/// Legacy entry point: size floor plus version marker, no hash.
pub fn verify(candidate: &Path, target_version: &str) -> bool {
    Verifier::new(target_version).check(candidate).is_ok()
}

/// `"1.4.0"` -> `b"140"`.
pub fn version_marker(target_version: &str) -> Vec<u8> {
    target_version.replace('.', "").into_bytes()
}

/// Parallel substring search. Windows overlap by `marker.len() - 1` bytes so a
/// match straddling a boundary is still found.
fn contains_marker(data: &[u8], marker: &[u8]) -> bool {
    if marker.is_empty() || data.len() < marker.len() {
        return false;
    }
    let overlap = marker.len() - 1;
    (0..data.len())
        .step_by(SEARCH_WINDOW)
        .collect::<Vec<_>>()
        .into_par_iter()
        .any(|start| {
            let end = (start + SEARCH_WINDOW + overlap).min(data.len());
            data[start..end].windows(marker.len()).any(|w| w == marker)
        })
}
