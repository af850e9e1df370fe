//! Scanning of docker-save tarballs.
//!
//! A `docker save` archive carries a `manifest.json` describing one or
//! more images, a config JSON per image and the layer tars. The whole
//! file may additionally be gzip-compressed; the magic bytes decide.

use crate::archive::layout::ImageLayout;
use crate::error::{AppError, Result};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tar::Archive;

/// One entry of a docker-save `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

/// The slice of an image config the archive store cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigDoc {
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default, rename = "os.version")]
    pub os_version: Option<String>,
    #[serde(default)]
    pub config: Option<InnerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InnerConfig {
    #[serde(default, rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
}

impl ImageConfigDoc {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }
}

/// Gzip magic number check (`1F 8B`).
pub fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Open a tar archive, transparently decompressing gzip input.
fn open_archive(tar_path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let mut file = File::open(tar_path)
        .map_err(|e| AppError::Io(format!("failed to open {}: {}", tar_path.display(), e)))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if n == 2 && is_gzipped(&magic) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = Archive::new(reader);
    archive.set_ignore_zeros(true);
    Ok(archive)
}

/// Read and parse `manifest.json` out of the tarball.
pub fn read_manifest(tar_path: &Path) -> Result<Vec<DockerManifestEntry>> {
    let mut archive = open_archive(tar_path)?;
    for entry in archive
        .entries()
        .map_err(|e| AppError::Parse(format!("failed to read tar entries: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| AppError::Parse(format!("failed to read tar entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| AppError::Parse(format!("failed to read entry path: {}", e)))?
            .to_string_lossy()
            .to_string();
        if path == "manifest.json" {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            return serde_json::from_str(&contents)
                .map_err(|e| AppError::Parse(format!("failed to parse manifest.json: {}", e)));
        }
    }
    Err(AppError::Parse(
        "no manifest.json found in tar archive".to_string(),
    ))
}

/// Stream the wanted entries out of the tarball into the layout's blob
/// store in a single pass. Returns a map of tar path to `(digest, size)`.
pub fn import_blobs(
    tar_path: &Path,
    wanted: &[String],
    layout: &ImageLayout,
) -> Result<HashMap<String, (String, u64)>> {
    let mut archive = open_archive(tar_path)?;
    let mut imported = HashMap::new();
    for entry in archive
        .entries()
        .map_err(|e| AppError::Parse(format!("failed to read tar entries: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| AppError::Parse(format!("failed to read tar entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| AppError::Parse(format!("failed to read entry path: {}", e)))?
            .to_string_lossy()
            .to_string();
        if wanted.iter().any(|w| w == &path) {
            let blob = layout.write_blob_stream(&mut entry)?;
            imported.insert(path, blob);
        }
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_gzipped() {
        assert!(is_gzipped(&[0x1f, 0x8b, 0x08]));
        assert!(!is_gzipped(b"not gzip"));
        assert!(!is_gzipped(&[0x1f]));
    }

    #[test]
    fn test_config_label_lookup() {
        let doc: ImageConfigDoc = serde_json::from_str(
            r#"{"architecture":"arm64","os":"linux","config":{"Labels":{"org.opencontainers.image.version":"1.2.3"}}}"#,
        )
        .unwrap();
        assert_eq!(doc.architecture.as_deref(), Some("arm64"));
        assert_eq!(
            doc.label("org.opencontainers.image.version"),
            Some("1.2.3")
        );
        assert_eq!(doc.label("missing"), None);
    }
}
