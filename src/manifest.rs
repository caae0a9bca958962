use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, UpdateError};

/// File name of the manifest inside a diff artifact.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Ordered description of how to rebuild the target binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffManifest {
    pub current_version: String,
    pub target_version: String,
    /// Hex BLAKE3 of the reconstructed binary. Optional; legacy manifests omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_blake3: Option<String>,
    pub chunks: Vec<DiffChunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
    Copy,
    Insert,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffChunk {
    #[serde(rename = "type", alias = "kind")]
    pub kind: ChunkKind,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl DiffChunk {
    pub fn copy(offset: u64, length: u64) -> Self {
        Self {
            kind: ChunkKind::Copy,
            offset,
            length,
            file_name: None,
        }
    }

    pub fn insert(file_name: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Insert,
            offset: 0,
            length: 0,
            file_name: Some(file_name.into()),
        }
    }

    pub fn replace(file_name: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Replace,
            offset: 0,
            length: 0,
            file_name: Some(file_name.into()),
        }
    }
}

impl DiffManifest {
    /// Parse and validate a manifest from JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: DiffManifest = serde_json::from_str(text)
            .map_err(|e| UpdateError::Manifest(format!("invalid manifest JSON: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read, parse and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            UpdateError::Manifest(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunks.is_empty() {
            return Err(UpdateError::Manifest("manifest has no chunks".into()));
        }
        if self.target_version.trim().is_empty() {
            return Err(UpdateError::Manifest("targetVersion is empty".into()));
        }
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.kind != ChunkKind::Copy
                && chunk.file_name.as_deref().map_or(true, str::is_empty)
            {
                return Err(UpdateError::Manifest(format!(
                    "chunk {index}: {:?} chunk has no fileName",
                    chunk.kind
                )));
            }
        }
        self.expected_hash()?;
        Ok(())
    }

    /// Decoded `targetBlake3`, if the manifest carries one.
    pub fn expected_hash(&self) -> Result<Option<[u8; 32]>> {
        match &self.target_blake3 {
            None => Ok(None),
            Some(hex) => blake3::Hash::from_hex(hex.trim())
                .map(|h| Some(*h.as_bytes()))
                .map_err(|e| UpdateError::Manifest(format!("invalid targetBlake3: {e}"))),
        }
    }
}
