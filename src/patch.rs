use rayon::prelude::*;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, UpdateError};
use crate::manifest::{ChunkKind, DiffManifest};

/// One resolved chunk: either a borrowed range of the base image or an
/// asset file that still has to be read.
enum Segment<'a> {
    Base(&'a [u8]),
    Asset {
        index: usize,
        file_name: &'a str,
        path: PathBuf,
    },
}

/// Reconstruct the target binary from the base image, the manifest and the
/// extracted package directory.
///
/// Chunks are checked in manifest order first, so the reported error is always
/// the first offending chunk. Asset files are then read in parallel and the
/// output is assembled in manifest order. `Insert` and `Replace` both append the
/// whole asset; their `offset`/`length` are ignored.
pub fn apply(base: &[u8], manifest: &DiffManifest, package_dir: &Path) -> Result<Vec<u8>> {
    let package_root = package_dir
        .canonicalize()
        .map_err(|e| UpdateError::io(package_dir, e))?;

    let mut plan = Vec::with_capacity(manifest.chunks.len());
    for (index, chunk) in manifest.chunks.iter().enumerate() {
        let segment = match chunk.kind {
            ChunkKind::Copy => {
                Segment::Base(copy_range(base, index, chunk.offset, chunk.length)?)
            }
            ChunkKind::Insert | ChunkKind::Replace => {
                let file_name = chunk.file_name.as_deref().ok_or_else(|| {
                    UpdateError::Manifest(format!(
                        "chunk {index}: {:?} chunk has no fileName",
                        chunk.kind
                    ))
                })?;
                Segment::Asset {
                    index,
                    file_name,
                    path: resolve_asset(&package_root, index, file_name)?,
                }
            }
        };
        plan.push(segment);
    }

    let parts: Vec<Cow<'_, [u8]>> = plan
        .into_par_iter()
        .map(|segment| match segment {
            Segment::Base(bytes) => Ok(Cow::Borrowed(bytes)),
            Segment::Asset {
                index,
                file_name,
                path,
            } => match std::fs::read(&path) {
                Ok(data) => Ok(Cow::Owned(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(UpdateError::MissingAsset {
                        index,
                        file_name: file_name.to_string(),
                    })
                }
                Err(e) => Err(UpdateError::io(path, e)),
            },
        })
        .collect::<Result<Vec<Cow<[u8]>>>>()?;

    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut result = Vec::with_capacity(total);
    for part in &parts {
        result.extend_from_slice(part);
    }

    tracing::debug!(chunks = parts.len(), bytes = result.len(), "patch applied");
    Ok(result)
}

/// Bounds-checked `base[offset..offset + length]`.
fn copy_range(base: &[u8], index: usize, offset: u64, length: u64) -> Result<&[u8]> {
    let out_of_range = || UpdateError::Range {
        index,
        offset,
        length,
        base_len: base.len() as u64,
    };
    let end = offset.checked_add(length).ok_or_else(out_of_range)?;
    if end > base.len() as u64 {
        return Err(out_of_range());
    }
    Ok(&base[offset as usize..end as usize])
}

/// Resolve an asset name to a regular file inside `root` (already canonical).
///
/// Names with `..`, a root, or a drive prefix are rejected before touching the
/// disk. Symlinks are followed and must still land inside `root`.
fn resolve_asset(root: &Path, index: usize, file_name: &str) -> Result<PathBuf> {
    let violation = || UpdateError::PathViolation {
        index,
        file_name: file_name.to_string(),
    };
    let missing = || UpdateError::MissingAsset {
        index,
        file_name: file_name.to_string(),
    };

    // Backslashes count as separators too; archives built on Windows use them.
    if file_name.split(['/', '\\']).any(|part| part == "..") {
        return Err(violation());
    }
    let relative = Path::new(file_name);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(violation());
    }

    let resolved = match root.join(relative).canonicalize() {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => return Err(UpdateError::io(root.join(relative), e)),
    };
    if !resolved.starts_with(root) {
        return Err(violation());
    }
    if !resolved.is_file() {
        return Err(missing());
    }
    Ok(resolved)
}
