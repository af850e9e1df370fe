//! Default Copier: manifest-list aware copy over the Registry v2 API.
//!
//! One instance serves one attempt. It resolves the source (another
//! registry, or an OCI layout on disk for `archive://` sources), walks
//! the index down to its manifests and blobs, uploads whatever the
//! target is missing, and finally tags the top-level manifest. Every
//! network await races the attempt's cancellation token so a canceled
//! task unwinds mid-transfer.

use crate::archive::layout::{ImageIndex, ImageLayout, ImageManifest};
use crate::credentials::RegistryAuth;
use crate::error::{AppError, Result};
use crate::refs;
use crate::registry::auth;
use crate::registry::client::upstream_error;
use crate::sync::copier::{Copier, CopierFactory, CopyRequest, Progress};
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Builds an [`HttpCopier`] per attempt, sharing one HTTP client.
pub struct HttpCopierFactory {
    client: Client,
}

impl HttpCopierFactory {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| AppError::internal(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }
}

impl CopierFactory for HttpCopierFactory {
    fn create(
        &self,
        cancel: CancellationToken,
        progress: mpsc::Sender<Progress>,
    ) -> Box<dyn Copier> {
        Box::new(HttpCopier {
            client: self.client.clone(),
            cancel,
            progress,
        })
    }
}

pub struct HttpCopier {
    client: Client,
    cancel: CancellationToken,
    progress: mpsc::Sender<Progress>,
}

impl Copier for HttpCopier {
    fn sync_manifest_list<'a>(&'a self, req: &'a CopyRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run(req))
    }
}

/// An authenticated registry endpoint for one repository scope.
struct Endpoint {
    base_url: String,
    token: Option<String>,
    auth: Option<RegistryAuth>,
}

impl Endpoint {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token)
        } else if let Some(auth) = &self.auth {
            request.basic_auth(&auth.username, Some(&auth.password))
        } else {
            request
        }
    }
}

impl HttpCopier {
    async fn run(&self, req: &CopyRequest) -> Result<()> {
        self.emit(Progress::info(format!(
            "copying {} -> {}",
            req.source_ref, req.target_ref
        )))
        .await;

        let (target_host, target_repo, target_reference) = refs::parse_image_ref(&req.target_ref);
        let target = self
            .connect(
                &target_host,
                req.target_auth.as_ref(),
                &format!("repository:{}:pull,push", target_repo),
            )
            .await?;

        if let Some(layout_path) = &req.source_layout_path {
            self.copy_from_layout(layout_path, &target, &target_repo, &target_reference)
                .await?;
        } else {
            let (source_host, source_repo, source_reference) =
                refs::parse_image_ref(&req.source_ref);
            let source = self
                .connect(
                    &source_host,
                    req.source_auth.as_ref(),
                    &format!("repository:{}:pull", source_repo),
                )
                .await?;
            self.copy_between_registries(
                &source,
                &source_repo,
                &source_reference,
                &target,
                &target_repo,
                &target_reference,
            )
            .await?;
        }

        self.emit(
            Progress::info(format!("synced {}", req.target_ref)).with_percent("manifest", 1.0),
        )
        .await;
        Ok(())
    }

    async fn connect(
        &self,
        host: &str,
        auth: Option<&RegistryAuth>,
        scope: &str,
    ) -> Result<Endpoint> {
        let base_url = refs::registry_base_url(host);
        let token = self
            .cancellable(auth::negotiate(&self.client, &base_url, auth, Some(scope)))
            .await??;
        Ok(Endpoint {
            base_url,
            token,
            auth: auth.cloned(),
        })
    }

    async fn copy_between_registries(
        &self,
        source: &Endpoint,
        source_repo: &str,
        source_reference: &str,
        target: &Endpoint,
        target_repo: &str,
        target_reference: &str,
    ) -> Result<()> {
        let (media_type, manifest_bytes) = self
            .get_manifest(source, source_repo, source_reference)
            .await?;

        if let Ok(index) = serde_json::from_slice::<ImageIndex>(&manifest_bytes) {
            // Manifest list: every child manifest is pushed by digest
            // before the index itself is tagged.
            let total = index.manifests.len().max(1);
            for (i, descriptor) in index.manifests.iter().enumerate() {
                let (child_type, child_bytes) = self
                    .get_manifest(source, source_repo, &descriptor.digest)
                    .await?;
                self.copy_manifest_blobs(source, source_repo, target, target_repo, &child_bytes)
                    .await?;
                self.put_manifest(
                    target,
                    target_repo,
                    &descriptor.digest,
                    &child_type,
                    child_bytes,
                )
                .await?;
                self.emit(
                    Progress::info(format!("pushed manifest {}", descriptor.digest))
                        .with_percent("manifests", 0.2 + 0.7 * (i + 1) as f64 / total as f64),
                )
                .await;
            }
        } else {
            self.copy_manifest_blobs(source, source_repo, target, target_repo, &manifest_bytes)
                .await?;
        }

        self.put_manifest(
            target,
            target_repo,
            target_reference,
            &media_type,
            manifest_bytes,
        )
        .await
    }

    /// Push every blob a single-image manifest references.
    async fn copy_manifest_blobs(
        &self,
        source: &Endpoint,
        source_repo: &str,
        target: &Endpoint,
        target_repo: &str,
        manifest_bytes: &[u8],
    ) -> Result<()> {
        let manifest: ImageManifest = serde_json::from_slice(manifest_bytes)
            .map_err(|e| AppError::Parse(format!("unsupported manifest shape: {}", e)))?;

        let blobs: Vec<_> = std::iter::once(&manifest.config)
            .chain(manifest.layers.iter())
            .collect();
        let total = blobs.len().max(1);
        for (i, descriptor) in blobs.iter().enumerate() {
            if !self.blob_exists(target, target_repo, &descriptor.digest).await? {
                let data = self
                    .get_blob(source, source_repo, &descriptor.digest)
                    .await?;
                self.upload_blob(target, target_repo, &descriptor.digest, data)
                    .await?;
            }
            self.emit(
                Progress::info(format!("blob {} present", descriptor.digest))
                    .with_percent("blobs", 0.1 + 0.6 * (i + 1) as f64 / total as f64),
            )
            .await;
        }
        Ok(())
    }

    /// Push an OCI layout (an archive source) to the target registry.
    async fn copy_from_layout(
        &self,
        layout_path: &Path,
        target: &Endpoint,
        target_repo: &str,
        target_reference: &str,
    ) -> Result<()> {
        let image_layout = ImageLayout::open(layout_path)?;
        let index = image_layout.read_index()?;

        let total = index.manifests.len().max(1);
        for (i, descriptor) in index.manifests.iter().enumerate() {
            let manifest_bytes = image_layout.read_blob(&descriptor.digest)?;
            let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;
            for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
                if !self.blob_exists(target, target_repo, &blob.digest).await? {
                    let data = image_layout.read_blob(&blob.digest)?;
                    self.upload_blob(target, target_repo, &blob.digest, data)
                        .await?;
                }
            }
            self.put_manifest(
                target,
                target_repo,
                &descriptor.digest,
                &descriptor.media_type,
                manifest_bytes,
            )
            .await?;
            self.emit(
                Progress::info(format!("pushed manifest {}", descriptor.digest))
                    .with_percent("manifests", 0.2 + 0.7 * (i + 1) as f64 / total as f64),
            )
            .await;
        }

        let index_bytes = serde_json::to_vec(&index)?;
        self.put_manifest(
            target,
            target_repo,
            target_reference,
            &index.media_type,
            index_bytes,
        )
        .await
    }

    async fn get_manifest(
        &self,
        endpoint: &Endpoint,
        repo: &str,
        reference: &str,
    ) -> Result<(String, Vec<u8>)> {
        let url = format!("{}/v2/{}/manifests/{}", endpoint.base_url, repo, reference);
        let response = self
            .send(endpoint.apply(self.client.get(&url)).header(ACCEPT, MANIFEST_ACCEPT))
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_MANIFEST_TYPE)
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        Ok((media_type, bytes))
    }

    async fn put_manifest(
        &self,
        endpoint: &Endpoint,
        repo: &str,
        reference: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let url = format!("{}/v2/{}/manifests/{}", endpoint.base_url, repo, reference);
        let response = self
            .send(
                endpoint
                    .apply(self.client.put(&url))
                    .header(CONTENT_TYPE, media_type)
                    .body(bytes),
            )
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }
        Ok(())
    }

    async fn blob_exists(&self, endpoint: &Endpoint, repo: &str, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/{}", endpoint.base_url, repo, digest);
        let response = self.send(endpoint.apply(self.client.head(&url))).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(upstream_error(status.as_u16(), &body))
            }
        }
    }

    async fn get_blob(&self, endpoint: &Endpoint, repo: &str, digest: &str) -> Result<Vec<u8>> {
        let url = format!("{}/v2/{}/blobs/{}", endpoint.base_url, repo, digest);
        let response = self.send(endpoint.apply(self.client.get(&url))).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }
        let data = response.bytes().await?.to_vec();
        verify_digest(digest, &data)?;
        Ok(data)
    }

    /// Monolithic blob upload: start an upload session, then PUT the
    /// whole blob against the returned location.
    async fn upload_blob(
        &self,
        endpoint: &Endpoint,
        repo: &str,
        digest: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        let start_url = format!("{}/v2/{}/blobs/uploads/", endpoint.base_url, repo);
        let response = self.send(endpoint.apply(self.client.post(&start_url))).await?;
        if response.status() != StatusCode::ACCEPTED {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::upstream("upload session returned no location"))?
            .to_string();

        let absolute = if location.starts_with("http") {
            location
        } else {
            format!("{}{}", endpoint.base_url, location)
        };
        let separator = if absolute.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", absolute, separator, digest);

        let response = self
            .send(
                endpoint
                    .apply(self.client.put(&put_url))
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(data),
            )
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }
        Ok(())
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        Ok(self.cancellable(request.send()).await??)
    }

    /// Race a future against the attempt's cancellation token.
    async fn cancellable<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(AppError::Canceled("context canceled".to_string())),
            value = fut => Ok(value),
        }
    }

    async fn emit(&self, progress: Progress) {
        let _ = self.progress.send(progress).await;
    }
}

fn verify_digest(expected: &str, data: &[u8]) -> Result<()> {
    let Some(hex_expected) = expected.strip_prefix("sha256:") else {
        // Foreign digest algorithms pass through unverified.
        return Ok(());
    };
    let mut hasher = Sha256::new();
    hasher.update(data);
    let actual = hex::encode(hasher.finalize());
    if actual != hex_expected {
        return Err(AppError::Parse(format!(
            "blob digest mismatch: expected sha256:{}, got sha256:{}",
            hex_expected, actual
        )));
    }
    Ok(())
}
