//! Archive store: uploaded image tarballs rewritten into OCI layouts.
//!
//! Each upload becomes `archives/<id>/layout/…`, a content-addressed
//! image layout with a single-manifest index, and an entry in the
//! `archives.json` metadata index. Archives are addressable as sync
//! sources through `archive://<id>` refs, and several archives can be
//! merged into one multi-platform index.

pub mod docker_tar;
pub mod layout;

use crate::error::{AppError, Result};
use crate::fsutil;
use crate::refs::ARCHIVE_SCHEME;
use docker_tar::ImageConfigDoc;
use layout::{
    ANNOTATION_REF_NAME, Descriptor, ImageIndex, ImageLayout, ImageManifest,
    MEDIA_TYPE_LAYER_TAR, MEDIA_TYPE_LAYER_TAR_GZIP, MEDIA_TYPE_OCI_CONFIG,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Marker platform values for merged multi-platform archives.
const MULTI_ARCH: &str = "multi-arch";
const MULTI_OS: &str = "multi-os";

const LABEL_REF_NAME: &str = "org.opencontainers.image.ref.name";
const LABEL_VERSION: &str = "org.opencontainers.image.version";
const LABEL_KWBASE_VERSION: &str = "kwbase_version";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMeta {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub created_at: String,
    pub layout_path: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

pub struct ArchiveStore {
    root: PathBuf,
    index_path: PathBuf,
    inner: Mutex<Vec<ArchiveMeta>>,
}

impl ArchiveStore {
    pub fn open(root: PathBuf, index_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let metas = if index_path.exists() {
            fsutil::read_json(&index_path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            root,
            index_path,
            inner: Mutex::new(metas),
        })
    }

    fn persist(&self, metas: &[ArchiveMeta]) -> Result<()> {
        fsutil::atomic_write_json(&self.index_path, &metas)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("archive index poisoned").len()
    }

    /// Store one uploaded tarball: rewrite it into a layout and prepend
    /// the metadata entry.
    pub fn store_upload(&self, original_name: &str, data: &[u8]) -> Result<ArchiveMeta> {
        if data.is_empty() {
            return Err(AppError::validation("uploaded file is empty"));
        }
        let stem = file_stem(original_name);
        let id = format!(
            "archive_{}_{}",
            fsutil::now_nanos(),
            fsutil::sanitize_component(stem)
        );
        let dir = self.root.join(&id);
        fs::create_dir_all(&dir)?;
        let temp_tar = dir.join("temp.tar");
        fs::write(&temp_tar, data)?;

        let built = self.build_from_tar(&id, &dir, &temp_tar, original_name, data.len() as u64);
        let _ = fs::remove_file(&temp_tar);
        let meta = match built {
            Ok(meta) => meta,
            Err(err) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(err);
            }
        };

        let mut metas = self.inner.lock().expect("archive index poisoned");
        metas.insert(0, meta.clone());
        self.persist(&metas)?;
        Ok(meta)
    }

    fn build_from_tar(
        &self,
        id: &str,
        dir: &Path,
        temp_tar: &Path,
        original_name: &str,
        upload_size: u64,
    ) -> Result<ArchiveMeta> {
        let manifest = docker_tar::read_manifest(temp_tar)?;
        let entry = manifest
            .first()
            .ok_or_else(|| AppError::Parse("tar manifest.json is empty".to_string()))?;

        let image_layout = ImageLayout::create(&dir.join("layout"))?;

        let mut wanted = vec![entry.config.clone()];
        wanted.extend(entry.layers.iter().cloned());
        let imported = docker_tar::import_blobs(temp_tar, &wanted, &image_layout)?;

        let (config_digest, config_size) = imported
            .get(&entry.config)
            .ok_or_else(|| AppError::Parse(format!("config blob {} missing", entry.config)))?
            .clone();
        let config_doc: ImageConfigDoc =
            serde_json::from_slice(&image_layout.read_blob(&config_digest)?)?;

        let mut layers = Vec::new();
        for layer_path in &entry.layers {
            let (digest, size) = imported
                .get(layer_path)
                .ok_or_else(|| AppError::Parse(format!("layer blob {} missing", layer_path)))?
                .clone();
            let media_type = if blob_is_gzipped(&image_layout, &digest) {
                MEDIA_TYPE_LAYER_TAR_GZIP
            } else {
                MEDIA_TYPE_LAYER_TAR
            };
            layers.push(Descriptor {
                media_type: media_type.to_string(),
                digest,
                size,
                platform: None,
                annotations: None,
            });
        }

        let manifest_doc = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: Descriptor {
                media_type: MEDIA_TYPE_OCI_CONFIG.to_string(),
                digest: config_digest,
                size: config_size,
                platform: None,
                annotations: None,
            },
            layers,
        };
        let (manifest_digest, manifest_size) =
            image_layout.write_blob(&serde_json::to_vec(&manifest_doc)?)?;

        let (name, tag) = resolve_name_tag(
            entry.repo_tags.as_deref().unwrap_or(&[]),
            &config_doc,
            original_name,
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_REF_NAME.to_string(), format!("{}:{}", name, tag));
        let index = ImageIndex {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests: vec![Descriptor {
                media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
                digest: manifest_digest.clone(),
                size: manifest_size,
                platform: Some(layout::Platform {
                    architecture: config_doc
                        .architecture
                        .clone()
                        .unwrap_or_else(|| "amd64".to_string()),
                    os: config_doc.os.clone().unwrap_or_else(|| "linux".to_string()),
                    variant: config_doc.variant.clone(),
                    os_version: config_doc.os_version.clone(),
                }),
                annotations: Some(annotations),
            }],
        };
        image_layout.write_index(&index)?;

        Ok(ArchiveMeta {
            id: id.to_string(),
            name,
            size: upload_size,
            created_at: fsutil::now_rfc3339_nanos(),
            layout_path: image_layout.root().to_string_lossy().to_string(),
            reference: format!("{}{}", ARCHIVE_SCHEME, id),
            architecture: config_doc.architecture,
            os: config_doc.os,
            tag: Some(tag),
            digest: Some(manifest_digest),
        })
    }

    /// Merge several archives into a single multi-platform index.
    pub fn merge(
        &self,
        ids: &[String],
        name: Option<String>,
        tag: Option<String>,
    ) -> Result<ArchiveMeta> {
        if ids.len() < 2 {
            return Err(AppError::validation(
                "merge requires at least two archive ids",
            ));
        }
        let sources: Vec<ArchiveMeta> = {
            let metas = self.inner.lock().expect("archive index poisoned");
            ids.iter()
                .map(|id| {
                    metas
                        .iter()
                        .find(|m| &m.id == id)
                        .cloned()
                        .ok_or_else(|| AppError::not_found(format!("archive not found: {}", id)))
                })
                .collect::<Result<_>>()?
        };

        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| sources[0].name.clone());
        let tag = tag
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "latest".to_string());

        let id = format!(
            "archive_{}_{}",
            fsutil::now_nanos(),
            fsutil::sanitize_component(&name)
        );
        let dir = self.root.join(&id);
        let merged = self.build_merged(&dir, &sources, &name, &tag);
        let meta = match merged {
            Ok(mut meta) => {
                meta.id = id.clone();
                meta.reference = format!("{}{}", ARCHIVE_SCHEME, id);
                meta
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(err);
            }
        };

        let mut metas = self.inner.lock().expect("archive index poisoned");
        metas.insert(0, meta.clone());
        self.persist(&metas)?;
        Ok(meta)
    }

    fn build_merged(
        &self,
        dir: &Path,
        sources: &[ArchiveMeta],
        name: &str,
        tag: &str,
    ) -> Result<ArchiveMeta> {
        let merged_layout = ImageLayout::create(&dir.join("layout"))?;
        let mut manifests = Vec::new();
        for source in sources {
            let source_layout = ImageLayout::open(Path::new(&source.layout_path))?;
            let index = source_layout.read_index()?;
            for descriptor in index.manifests {
                let manifest_bytes = source_layout.read_blob(&descriptor.digest)?;
                let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
                merged_layout.import_blob_from(&source_layout, &manifest.config.digest)?;
                for layer in &manifest.layers {
                    merged_layout.import_blob_from(&source_layout, &layer.digest)?;
                }
                merged_layout.write_blob(&manifest_bytes)?;
                // Platform information travels with the descriptor.
                manifests.push(descriptor);
            }
        }

        let index = ImageIndex {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests,
        };
        merged_layout.write_index(&index)?;

        Ok(ArchiveMeta {
            id: String::new(),
            name: name.to_string(),
            size: fsutil::dir_size(merged_layout.root()),
            created_at: fsutil::now_rfc3339_nanos(),
            layout_path: merged_layout.root().to_string_lossy().to_string(),
            reference: String::new(),
            architecture: Some(MULTI_ARCH.to_string()),
            os: Some(MULTI_OS.to_string()),
            tag: Some(tag.to_string()),
            digest: None,
        })
    }

    /// All archives, newest first. Single-image entries with missing
    /// platform data or a defaulted tag are re-examined against their
    /// layout and repaired in place; merged archives are left alone.
    pub fn list(&self) -> Result<Vec<ArchiveMeta>> {
        let mut metas = self.inner.lock().expect("archive index poisoned");
        let mut dirty = false;
        for meta in metas.iter_mut() {
            if meta.architecture.as_deref() == Some(MULTI_ARCH) {
                continue;
            }
            let wants_repair = meta.architecture.is_none()
                || meta.os.is_none()
                || matches!(meta.tag.as_deref(), None | Some("") | Some("latest"));
            if wants_repair && repair_meta(meta) {
                dirty = true;
            }
        }
        if dirty {
            self.persist(&metas)?;
        }
        Ok(metas.clone())
    }

    /// Delete an archive directory and its index entry. The directory is
    /// only removed when it sits directly beneath the archives root.
    pub fn delete(&self, id: &str) -> Result<()> {
        fsutil::check_id(id)?;
        let mut metas = self.inner.lock().expect("archive index poisoned");
        let position = metas
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| AppError::not_found(format!("archive not found: {}", id)))?;

        let dir = self.root.join(id);
        if dir.parent() == Some(self.root.as_path()) && dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        metas.remove(position);
        self.persist(&metas)
    }

    /// Resolve `archive://<id>` to the layout directory.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let id = reference
            .strip_prefix(ARCHIVE_SCHEME)
            .ok_or_else(|| AppError::validation(format!("not an archive ref: {}", reference)))?;
        let metas = self.inner.lock().expect("archive index poisoned");
        let meta = metas
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| AppError::not_found(format!("archive not found: {}", id)))?;
        let path = PathBuf::from(&meta.layout_path);
        if !path.exists() {
            return Err(AppError::not_found(format!(
                "archive layout missing for {}",
                id
            )));
        }
        Ok(path)
    }
}

fn file_stem(name: &str) -> &str {
    for suffix in [".tar.gz", ".tgz", ".tar"] {
        if let Some(stem) = name.strip_suffix(suffix) {
            return stem;
        }
    }
    name
}

/// Name and tag resolution: `RepoTags[0]` wins, then image labels, then
/// the uploaded filename with tag `latest`.
fn resolve_name_tag(
    repo_tags: &[String],
    config: &ImageConfigDoc,
    original_name: &str,
) -> (String, String) {
    if let Some(repo_tag) = repo_tags.first() {
        if let Some((name, tag)) = repo_tag.rsplit_once(':') {
            if !tag.contains('/') {
                return (name.to_string(), tag.to_string());
            }
        }
        return (repo_tag.clone(), "latest".to_string());
    }

    let name = config
        .label(LABEL_REF_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| file_stem(original_name).to_string());
    let tag = config
        .label(LABEL_VERSION)
        .or_else(|| config.label(LABEL_KWBASE_VERSION))
        .map(str::to_string)
        .unwrap_or_else(|| "latest".to_string());
    (name, tag)
}

fn blob_is_gzipped(image_layout: &ImageLayout, digest: &str) -> bool {
    let mut magic = [0u8; 2];
    match fs::File::open(image_layout.blob_path(digest)) {
        Ok(mut file) => match file.read(&mut magic) {
            Ok(n) => n == 2 && docker_tar::is_gzipped(&magic),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

/// Re-derive platform and tag data from the layout. Returns true when
/// anything changed.
fn repair_meta(meta: &mut ArchiveMeta) -> bool {
    let Ok(image_layout) = ImageLayout::open(Path::new(&meta.layout_path)) else {
        return false;
    };
    let Ok(index) = image_layout.read_index() else {
        return false;
    };
    let Some(descriptor) = index.manifests.first() else {
        return false;
    };

    let mut changed = false;
    if let Some(platform) = &descriptor.platform {
        if meta.architecture.is_none() {
            meta.architecture = Some(platform.architecture.clone());
            changed = true;
        }
        if meta.os.is_none() {
            meta.os = Some(platform.os.clone());
            changed = true;
        }
    }

    if matches!(meta.tag.as_deref(), None | Some("") | Some("latest")) {
        let tag = image_layout
            .read_blob(&descriptor.digest)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ImageManifest>(&bytes).ok())
            .and_then(|manifest| image_layout.read_blob(&manifest.config.digest).ok())
            .and_then(|bytes| serde_json::from_slice::<ImageConfigDoc>(&bytes).ok())
            .and_then(|config| {
                config
                    .label(LABEL_VERSION)
                    .or_else(|| config.label(LABEL_KWBASE_VERSION))
                    .map(str::to_string)
            });
        if let Some(tag) = tag {
            if meta.tag.as_deref() != Some(tag.as_str()) {
                meta.tag = Some(tag);
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal docker-save tarball in memory.
    fn sample_tar(repo_tags: Option<&[&str]>, labels: Option<serde_json::Value>) -> Vec<u8> {
        let config = serde_json::json!({
            "architecture": "arm64",
            "os": "linux",
            "config": {"Labels": labels.unwrap_or(serde_json::json!({}))}
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let layer_bytes = b"fake layer contents".to_vec();
        let manifest = serde_json::json!([{
            "Config": "config.json",
            "RepoTags": repo_tags,
            "Layers": ["layer1/layer.tar"]
        }]);
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in [
            ("manifest.json", manifest_bytes.as_slice()),
            ("config.json", config_bytes.as_slice()),
            ("layer1/layer.tar", layer_bytes.as_slice()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn store() -> (tempfile::TempDir, ArchiveStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(
            dir.path().join("archives"),
            dir.path().join("archives.json"),
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn test_upload_builds_layout_and_meta() {
        let (_dir, store) = store();
        let tar = sample_tar(Some(&["myorg/myapp:v2"]), None);
        let meta = store.store_upload("myapp.tar", &tar).unwrap();

        assert!(meta.id.starts_with("archive_"));
        assert!(meta.id.ends_with("_myapp"));
        assert_eq!(meta.name, "myorg/myapp");
        assert_eq!(meta.tag.as_deref(), Some("v2"));
        assert_eq!(meta.architecture.as_deref(), Some("arm64"));
        assert_eq!(meta.os.as_deref(), Some("linux"));
        assert_eq!(meta.size, tar.len() as u64);
        assert!(meta.reference.starts_with("archive://"));

        let image_layout = ImageLayout::open(Path::new(&meta.layout_path)).unwrap();
        let index = image_layout.read_index().unwrap();
        assert_eq!(index.manifests.len(), 1);
        let platform = index.manifests[0].platform.as_ref().unwrap();
        assert_eq!(platform.architecture, "arm64");
        assert!(image_layout.has_blob(index.manifests[0].digest.as_str()));

        // The temp tar is gone.
        let archive_dir = Path::new(&meta.layout_path).parent().unwrap();
        assert!(!archive_dir.join("temp.tar").exists());
    }

    #[test]
    fn test_upload_gzipped_tar() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let (_dir, store) = store();
        let tar = sample_tar(Some(&["gz/app:v1"]), None);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&tar).unwrap();
        let gz = encoder.finish().unwrap();

        let meta = store.store_upload("app.tar.gz", &gz).unwrap();
        assert_eq!(meta.name, "gz/app");
        assert_eq!(meta.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_name_tag_falls_back_to_labels_then_filename() {
        let (_dir, store) = store();
        let tar = sample_tar(
            None,
            Some(serde_json::json!({
                "org.opencontainers.image.ref.name": "labeled/app",
                "org.opencontainers.image.version": "3.1.4"
            })),
        );
        let meta = store.store_upload("upload.tar", &tar).unwrap();
        assert_eq!(meta.name, "labeled/app");
        assert_eq!(meta.tag.as_deref(), Some("3.1.4"));

        let tar = sample_tar(None, None);
        let meta = store.store_upload("plain-file.tar", &tar).unwrap();
        assert_eq!(meta.name, "plain-file");
        assert_eq!(meta.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_merge_produces_multi_platform_index() {
        let (_dir, store) = store();
        let a = store
            .store_upload("a.tar", &sample_tar(Some(&["app:arm"]), None))
            .unwrap();
        let b = store
            .store_upload("b.tar", &sample_tar(Some(&["app:x86"]), None))
            .unwrap();

        let merged = store
            .merge(
                &[a.id.clone(), b.id.clone()],
                Some("app".to_string()),
                Some("multi".to_string()),
            )
            .unwrap();
        assert_eq!(merged.architecture.as_deref(), Some("multi-arch"));
        assert_eq!(merged.os.as_deref(), Some("multi-os"));
        assert_eq!(merged.tag.as_deref(), Some("multi"));

        let image_layout = ImageLayout::open(Path::new(&merged.layout_path)).unwrap();
        let index = image_layout.read_index().unwrap();
        assert_eq!(index.manifests.len(), 2);
        for descriptor in &index.manifests {
            assert!(image_layout.has_blob(&descriptor.digest));
        }
    }

    #[test]
    fn test_merge_requires_two_known_archives() {
        let (_dir, store) = store();
        let a = store
            .store_upload("a.tar", &sample_tar(Some(&["app:v1"]), None))
            .unwrap();
        assert!(store.merge(&[a.id.clone()], None, None).is_err());
        assert!(
            store
                .merge(&[a.id.clone(), "archive_missing".to_string()], None, None)
                .is_err()
        );
    }

    #[test]
    fn test_resolve_and_delete() {
        let (_dir, store) = store();
        let meta = store
            .store_upload("a.tar", &sample_tar(Some(&["app:v1"]), None))
            .unwrap();

        let resolved = store.resolve(&meta.reference).unwrap();
        assert!(resolved.join("index.json").exists());

        store.delete(&meta.id).unwrap();
        assert!(store.resolve(&meta.reference).is_err());
        assert!(!resolved.exists());
        assert!(matches!(
            store.delete(&meta.id),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_rejects_traversal_ids() {
        let (_dir, store) = store();
        assert!(store.delete("../outside").is_err());
        assert!(store.delete("a/b").is_err());
    }

    #[test]
    fn test_list_is_newest_first() {
        let (_dir, store) = store();
        let a = store
            .store_upload("a.tar", &sample_tar(Some(&["app:v1"]), None))
            .unwrap();
        let b = store
            .store_upload("b.tar", &sample_tar(Some(&["app:v2"]), None))
            .unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[test]
    fn test_list_repairs_defaulted_tag_from_labels() {
        let (_dir, store) = store();
        let tar = sample_tar(
            None,
            Some(serde_json::json!({"org.opencontainers.image.version": "9.9"})),
        );
        let meta = store.store_upload("x.tar", &tar).unwrap();
        // Simulate an older index entry that never resolved its tag.
        {
            let mut metas = store.inner.lock().unwrap();
            metas[0].tag = Some("latest".to_string());
            metas[0].architecture = None;
            let snapshot = metas.clone();
            store.persist(&snapshot).unwrap();
        }
        let listed = store.list().unwrap();
        assert_eq!(listed[0].id, meta.id);
        assert_eq!(listed[0].tag.as_deref(), Some("9.9"));
        assert_eq!(listed[0].architecture.as_deref(), Some("arm64"));
    }
}
