//! Image-reference handling: registry-host normalization and parsing.
//!
//! A reference like `kwdb/smart-meter` is ambiguous: pushed through a
//! credential for a private registry it must become
//! `<registry-host>/kwdb/smart-meter`, while against Docker Hub it stays
//! as written. Normalization happens once, at task-planning time, so the
//! rest of the pipeline only ever sees fully-qualified refs.

/// Docker Hub aliases that never get prefixed onto a reference.
const HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

/// Canonical Docker Hub API host.
pub const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

/// Scheme prefix for archive-backed sync sources.
pub const ARCHIVE_SCHEME: &str = "archive://";

/// Extract the bare host (with optional port) from a registry address
/// that may carry a scheme or trailing path.
pub fn registry_host(registry: &str) -> String {
    let trimmed = registry.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or("")
        .trim_end_matches('/')
        .to_string()
}

/// True when the host is empty or a Docker Hub alias; such hosts are
/// never prepended to a reference.
pub fn is_default_registry(host: &str) -> bool {
    host.is_empty() || HUB_ALIASES.contains(&host)
}

/// True when the first path segment already names a registry: it
/// contains a `.` or `:`, or is `localhost`.
fn has_registry_prefix(image_ref: &str) -> bool {
    let first = image_ref.split('/').next().unwrap_or("");
    first.contains('.') || first.contains(':') || first == "localhost"
}

/// Prefix `image_ref` with the credential's registry host when the ref
/// does not already name a registry. Archive refs and refs already rooted
/// at `host` pass through unchanged, which keeps normalization idempotent
/// for the retry path.
pub fn normalize_ref(image_ref: &str, registry: &str) -> String {
    let image_ref = image_ref.trim();
    if image_ref.is_empty() || image_ref.starts_with(ARCHIVE_SCHEME) {
        return image_ref.to_string();
    }
    let host = registry_host(registry);
    if is_default_registry(&host) || has_registry_prefix(image_ref) {
        return image_ref.to_string();
    }
    if image_ref.starts_with(&format!("{}/", host)) {
        return image_ref.to_string();
    }
    format!("{}/{}", host, image_ref)
}

/// Split a fully-qualified reference into `(registry_host, repository,
/// reference)`. The reference is the tag, or the digest for `@`-pinned
/// refs; a missing tag defaults to `latest`. Bare Docker Hub refs get the
/// implicit `library/` namespace.
pub fn parse_image_ref(image_ref: &str) -> (String, String, String) {
    let image_ref = image_ref.trim();
    let (host, rest) = if has_registry_prefix(image_ref) {
        match image_ref.split_once('/') {
            Some((host, rest)) => (host.to_string(), rest.to_string()),
            None => (DOCKER_HUB_HOST.to_string(), image_ref.to_string()),
        }
    } else {
        (DOCKER_HUB_HOST.to_string(), image_ref.to_string())
    };

    let host = if is_default_registry(&host) {
        DOCKER_HUB_HOST.to_string()
    } else {
        host
    };

    let (repo, reference) = if let Some((repo, digest)) = rest.split_once('@') {
        (repo.to_string(), digest.to_string())
    } else {
        // Only a colon after the last slash is a tag separator.
        match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (rest.to_string(), "latest".to_string()),
        }
    };

    let repo = if host == DOCKER_HUB_HOST && !repo.contains('/') {
        format!("library/{}", repo)
    } else {
        repo
    };

    (host, repo, reference)
}

/// Base URL for talking to a registry host. Local registries commonly
/// run without TLS.
pub fn registry_base_url(host: &str) -> String {
    if host.starts_with("localhost") || host.starts_with("127.") {
        format!("http://{}", host)
    } else {
        format!("https://{}", host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_host_strips_scheme_and_path() {
        assert_eq!(registry_host("https://ghcr.io"), "ghcr.io");
        assert_eq!(registry_host("http://localhost:5000/v2/"), "localhost:5000");
        assert_eq!(
            registry_host("registry.cn-hangzhou.aliyuncs.com"),
            "registry.cn-hangzhou.aliyuncs.com"
        );
        assert_eq!(registry_host(""), "");
    }

    #[test]
    fn test_normalize_prefixes_unqualified_refs() {
        assert_eq!(
            normalize_ref("kwdb/smart-meter", "registry.cn-hangzhou.aliyuncs.com"),
            "registry.cn-hangzhou.aliyuncs.com/kwdb/smart-meter"
        );
        assert_eq!(
            normalize_ref("kwdb/smart-meter", "https://ghcr.io"),
            "ghcr.io/kwdb/smart-meter"
        );
    }

    #[test]
    fn test_normalize_leaves_hub_refs_alone() {
        assert_eq!(
            normalize_ref("kwdb/smart-meter", "docker.io"),
            "kwdb/smart-meter"
        );
        assert_eq!(
            normalize_ref("kwdb/smart-meter", "index.docker.io"),
            "kwdb/smart-meter"
        );
        assert_eq!(normalize_ref("kwdb/smart-meter", ""), "kwdb/smart-meter");
    }

    #[test]
    fn test_normalize_leaves_qualified_refs_alone() {
        assert_eq!(
            normalize_ref("ghcr.io/org/img:tag", "registry.example.com"),
            "ghcr.io/org/img:tag"
        );
        assert_eq!(
            normalize_ref("localhost/app", "registry.example.com"),
            "localhost/app"
        );
        assert_eq!(
            normalize_ref("myreg:5000/app", "registry.example.com"),
            "myreg:5000/app"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize_ref("kwdb/smart-meter", "ghcr.io");
        let twice = normalize_ref(&once, "ghcr.io");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_skips_archive_refs() {
        assert_eq!(
            normalize_ref("archive://archive_1_img", "ghcr.io"),
            "archive://archive_1_img"
        );
    }

    #[test]
    fn test_parse_image_ref() {
        assert_eq!(
            parse_image_ref("ghcr.io/org/img:v1"),
            (
                "ghcr.io".to_string(),
                "org/img".to_string(),
                "v1".to_string()
            )
        );
        assert_eq!(
            parse_image_ref("nginx"),
            (
                DOCKER_HUB_HOST.to_string(),
                "library/nginx".to_string(),
                "latest".to_string()
            )
        );
        assert_eq!(
            parse_image_ref("localhost:5000/app@sha256:abc"),
            (
                "localhost:5000".to_string(),
                "app".to_string(),
                "sha256:abc".to_string()
            )
        );
    }

    #[test]
    fn test_registry_base_url() {
        assert_eq!(registry_base_url("ghcr.io"), "https://ghcr.io");
        assert_eq!(registry_base_url("localhost:5000"), "http://localhost:5000");
    }
}
