use memmap2::Mmap;
use std::path::{Path, PathBuf};

use crate::error::{Result, UpdateError};

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path).map_err(|e| UpdateError::io(path, e))?;
    // SAFETY: We only read from this mapping; the orchestrator is the only writer of these paths.
    unsafe { Mmap::map(&file).map_err(|e| UpdateError::io(path, e)) }
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Stream-hash a file using BLAKE3.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file_streaming(path: &Path) -> Result<[u8; 32]> {
    let file = std::fs::File::open(path).map_err(|e| UpdateError::io(path, e))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher).map_err(|e| UpdateError::io(path, e))?;
    Ok(*hasher.finalize().as_bytes())
}

/// `<path><suffix>`, e.g. `app` + `.backup` -> `app.backup`.
/// Unlike `with_extension` this keeps an existing `.exe`.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Remove a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdateError::io(path, e)),
    }
}

/// Copy the permission bits of `from` onto `to`.
pub fn copy_permissions(from: &Path, to: &Path) -> Result<()> {
    let perms = std::fs::metadata(from)
        .map_err(|e| UpdateError::io(from, e))?
        .permissions();
    std::fs::set_permissions(to, perms).map_err(|e| UpdateError::io(to, e))
}

/// Move `src` onto `dest`, replacing whatever directory entry `dest` has.
///
/// On Unix this is a single `rename(2)`. Windows refuses to rename over an
/// existing file, so the old entry is removed first.
pub fn replace_file(src: &Path, dest: &Path) -> Result<()> {
    #[cfg(windows)]
    remove_file_if_exists(dest)?;
    std::fs::rename(src, dest).map_err(|e| UpdateError::io(dest, e))
}
