//! OCI image-layout directories: the content-addressed form every
//! uploaded archive is rewritten into.
//!
//! ```text
//! layout/
//!   oci-layout               {"imageLayoutVersion": "1.0.0"}
//!   index.json               image index with platform descriptors
//!   blobs/sha256/<hex>       manifests, configs and layers
//! ```

use crate::error::{AppError, Result};
use crate::fsutil;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Annotation carrying the original reference name on index entries.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(
        default,
        rename = "os.version",
        skip_serializing_if = "Option::is_none"
    )]
    pub os_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// Handle on one layout directory.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    root: PathBuf,
}

impl ImageLayout {
    /// Create a fresh layout skeleton at `root`.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("blobs").join("sha256"))?;
        fsutil::atomic_write_json(
            &root.join("oci-layout"),
            &LayoutMarker {
                image_layout_version: "1.0.0".to_string(),
            },
        )?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Open an existing layout.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join("index.json").exists() {
            return Err(AppError::not_found(format!(
                "no image layout at {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join("blobs").join("sha256").join(hex)
    }

    /// Store a blob, returning `(digest, size)`. Existing blobs are left
    /// in place: content addressing makes the write idempotent.
    pub fn write_blob(&self, data: &[u8]) -> Result<(String, u64)> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
        let path = self.blob_path(&digest);
        if !path.exists() {
            fsutil::atomic_write(&path, data)?;
        }
        Ok((digest, data.len() as u64))
    }

    /// Stream a blob in from a reader, hashing on the way through.
    pub fn write_blob_stream<R: Read>(&self, reader: &mut R) -> Result<(String, u64)> {
        let dir = self.root.join("blobs").join("sha256");
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".tmp-{}", fsutil::now_nanos()));
        let mut writer = HashingWriter {
            inner: File::create(&tmp)?,
            hasher: Sha256::new(),
            written: 0,
        };
        if let Err(err) = io::copy(reader, &mut writer) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        writer.inner.flush()?;
        let size = writer.written;
        let digest = format!("sha256:{}", hex::encode(writer.hasher.finalize()));
        let path = self.blob_path(&digest);
        if path.exists() {
            let _ = fs::remove_file(&tmp);
        } else {
            fs::rename(&tmp, &path)?;
        }
        Ok((digest, size))
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| AppError::Io(format!("blob {} unreadable: {}", digest, e)))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    pub fn write_index(&self, index: &ImageIndex) -> Result<()> {
        fsutil::atomic_write_json(&self.root.join("index.json"), index)
    }

    pub fn read_index(&self) -> Result<ImageIndex> {
        fsutil::read_json(&self.root.join("index.json"))
    }

    /// Copy one blob from another layout, skipping blobs already present.
    pub fn import_blob_from(&self, other: &ImageLayout, digest: &str) -> Result<()> {
        let dst = self.blob_path(digest);
        if dst.exists() {
            return Ok(());
        }
        let src = other.blob_path(digest);
        fs::copy(&src, &dst).map_err(|e| {
            AppError::Io(format!("failed to copy blob {}: {}", digest, e))
        })?;
        Ok(())
    }
}

struct HashingWriter {
    inner: File,
    hasher: Sha256,
    written: u64,
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
