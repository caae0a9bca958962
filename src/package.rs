use std::fs::File;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Result, UpdateError};
use crate::manifest::{DiffManifest, MANIFEST_FILE_NAME};

/// A diff artifact unpacked on disk.
#[derive(Debug)]
pub struct ExtractedPackage {
    /// Directory holding `manifest.json`; asset names resolve against it.
    pub root: PathBuf,
    pub manifest: DiffManifest,
    pub files_extracted: usize,
}

/// Unzip `archive_path` into `dest_dir` and load its manifest.
pub fn extract_package(archive_path: &Path, dest_dir: &Path) -> Result<ExtractedPackage> {
    let files_extracted = extract_zip(archive_path, dest_dir)?;
    let root = find_manifest_dir(dest_dir)?;
    let manifest = DiffManifest::load(&root.join(MANIFEST_FILE_NAME))?;
    tracing::debug!(
        root = %root.display(),
        files = files_extracted,
        chunks = manifest.chunks.len(),
        "package extracted"
    );
    Ok(ExtractedPackage {
        root,
        manifest,
        files_extracted,
    })
}

/// Open a package that is either a zip archive or an already-extracted
/// directory. Archives are unpacked into `scratch`.
pub fn open_package(path: &Path, scratch: &Path) -> Result<ExtractedPackage> {
    if path.is_dir() {
        let root = find_manifest_dir(path)?;
        let manifest = DiffManifest::load(&root.join(MANIFEST_FILE_NAME))?;
        Ok(ExtractedPackage {
            root,
            manifest,
            files_extracted: 0,
        })
    } else {
        extract_package(path, scratch)
    }
}

/// Extract every regular entry. Entries whose names would land outside
/// `dest_dir` are skipped.
fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<usize> {
    let file = File::open(archive_path).map_err(|e| UpdateError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| UpdateError::Archive(format!("{}: {e}", archive_path.display())))?;

    std::fs::create_dir_all(dest_dir).map_err(|e| UpdateError::io(dest_dir, e))?;

    let mut count = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| UpdateError::Archive(format!("entry {i}: {e}")))?;
        let entry_path = match entry.enclosed_name() {
            Some(p) => dest_dir.join(p),
            None => {
                tracing::warn!(name = entry.name(), "skipping archive entry outside package");
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&entry_path).map_err(|e| UpdateError::io(&entry_path, e))?;
        } else {
            if let Some(parent) = entry_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| UpdateError::io(parent, e))?;
            }
            let mut outfile =
                File::create(&entry_path).map_err(|e| UpdateError::io(&entry_path, e))?;
            std::io::copy(&mut entry, &mut outfile).map_err(|e| UpdateError::io(&entry_path, e))?;
            count += 1;
        }
    }
    Ok(count)
}

/// The manifest sits at the archive root or inside one top-level folder.
fn find_manifest_dir(dir: &Path) -> Result<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == MANIFEST_FILE_NAME)
        .filter_map(|entry| entry.path().parent().map(Path::to_path_buf))
        .collect();

    // Shallowest wins.
    found.sort_by_key(|p| p.components().count());
    found.into_iter().next().ok_or_else(|| {
        UpdateError::Manifest(format!(
            "no {MANIFEST_FILE_NAME} found in {}",
            dir.display()
        ))
    })
}
