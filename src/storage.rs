//! Tenant document storage.
//!
//! [`FsStorage`] keeps one directory per tenant under `storage.documents_dir`:
//!
//! ```text
//! documents/
//! ├── RC/
//! │   ├── policies/remote-work.md
//! │   ├── www_cms_gov_esmd.txt
//! │   └── www_cms_gov_esmd.txt.meta.json   # {"source_url": "https://www.cms.gov/esmd"}
//! └── HIH/
//!     └── faq.pdf
//! ```
//!
//! Files are selected with include/exclude globs. `*.meta.json` sidecars
//! carry the origin URL of web-ingested documents and are never indexed
//! themselves.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use tenant_rag_core::models::FileSignature;

use crate::config::StorageConfig;

const META_SUFFIX: &str = ".meta.json";

/// A stored document as listed, before hashing.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Path relative to the tenant root, forward slashes.
    pub path: String,
    pub size: u64,
    pub modified_ms: i64,
    pub source_url: Option<String>,
}

impl StoredDocument {
    /// Signature with a known content hash.
    pub fn signature(&self, hash: String) -> FileSignature {
        FileSignature {
            path: self.path.clone(),
            size: self.size,
            modified_ms: self.modified_ms,
            hash,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SidecarMeta {
    #[serde(default)]
    source_url: Option<String>,
}

/// Where tenant documents live.
pub trait DocumentStorage: Send + Sync {
    /// Tenant ids that have a document root, sorted.
    fn tenants(&self) -> Result<Vec<String>>;
    /// Documents of `tenant`, sorted by path. A missing root lists as empty.
    fn list(&self, tenant: &str) -> Result<Vec<StoredDocument>>;
    fn read(&self, tenant: &str, path: &str) -> Result<Vec<u8>>;
    /// Size and mtime of one document (hash left empty), `None` if gone.
    fn stat(&self, tenant: &str, path: &str) -> Result<Option<FileSignature>>;
    /// SHA-256 hex of one document's bytes.
    fn hash(&self, tenant: &str, path: &str) -> Result<String> {
        Ok(sha256_hex(&self.read(tenant, path)?))
    }
    /// Store `bytes` as `name` in the tenant root, with an optional origin URL.
    fn write(&self, tenant: &str, name: &str, bytes: &[u8], source_url: Option<&str>) -> Result<String>;
    /// Delete a tenant's document root.
    fn remove_tenant(&self, tenant: &str) -> Result<()>;
}

/// Filesystem-backed [`DocumentStorage`].
pub struct FsStorage {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FsStorage {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/.*.tmp".to_string(),
            format!("**/*{}", META_SUFFIX),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        Ok(Self {
            root: config.documents_dir.clone(),
            include,
            exclude,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn tenant_root(&self, tenant: &str) -> Result<PathBuf> {
        validate_tenant_id(tenant)?;
        Ok(self.root.join(tenant))
    }

    fn resolve(&self, tenant: &str, path: &str) -> Result<PathBuf> {
        if path.split('/').any(|part| part == ".." || part.is_empty()) {
            bail!("invalid document path: {}", path);
        }
        Ok(self.tenant_root(tenant)?.join(path))
    }
}

impl DocumentStorage for FsStorage {
    fn tenants(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut tenants = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read documents dir: {}", self.root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_tenant_id(&name).is_ok() {
                tenants.push(name);
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    fn list(&self, tenant: &str) -> Result<Vec<StoredDocument>> {
        let root = self.tenant_root(tenant)?;
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut docs = Vec::new();
        let walker = WalkDir::new(&root).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let metadata = entry.metadata()?;
            docs.push(StoredDocument {
                source_url: read_sidecar(path),
                path: rel_str,
                size: metadata.len(),
                modified_ms: modified_ms(metadata.modified().ok()),
            });
        }

        // Sort for deterministic ordering
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    fn read(&self, tenant: &str, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(tenant, path)?;
        std::fs::read(&full).with_context(|| format!("Failed to read {}", full.display()))
    }

    fn stat(&self, tenant: &str, path: &str) -> Result<Option<FileSignature>> {
        let full = self.resolve(tenant, path)?;
        match std::fs::metadata(&full) {
            Ok(metadata) => Ok(Some(FileSignature {
                path: path.to_string(),
                size: metadata.len(),
                modified_ms: modified_ms(metadata.modified().ok()),
                hash: String::new(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", full.display())),
        }
    }

    fn write(&self, tenant: &str, name: &str, bytes: &[u8], source_url: Option<&str>) -> Result<String> {
        if name.contains('/') || name.contains('\\') || name.starts_with('.') || name.is_empty() {
            bail!("invalid document name: {}", name);
        }
        let root = self.tenant_root(tenant)?;
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create {}", root.display()))?;

        if let Some(url) = source_url {
            let meta = serde_json::to_vec_pretty(&SidecarMeta {
                source_url: Some(url.to_string()),
            })?;
            write_atomic(&root, &format!("{}{}", name, META_SUFFIX), &meta)?;
        }
        write_atomic(&root, name, bytes)?;
        Ok(name.to_string())
    }

    fn remove_tenant(&self, tenant: &str) -> Result<()> {
        let root = self.tenant_root(tenant)?;
        if root.exists() {
            std::fs::remove_dir_all(&root)
                .with_context(|| format!("Failed to remove {}", root.display()))?;
        }
        Ok(())
    }
}

/// Tenant ids name directories: ASCII letters, digits, `-` and `_`.
pub fn validate_tenant_id(tenant: &str) -> Result<()> {
    if tenant.is_empty()
        || tenant.len() > 64
        || !tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid tenant id '{}': use letters, digits, '-' or '_'", tenant);
    }
    Ok(())
}

/// Write `dir/name` via a hidden temp file and rename.
pub fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!(".{}.tmp", name));
    let target = dir.join(name);
    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &target)
        .with_context(|| format!("Failed to move {} into place", target.display()))?;
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

fn read_sidecar(path: &Path) -> Option<String> {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(META_SUFFIX);
    let raw = std::fs::read(PathBuf::from(sidecar)).ok()?;
    serde_json::from_slice::<SidecarMeta>(&raw).ok()?.source_url
}

fn modified_ms(modified: Option<SystemTime>) -> i64 {
    modified
        .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> FsStorage {
        FsStorage::new(&StorageConfig {
            documents_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn lists_tenants_and_documents() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("RC/policies")).unwrap();
        std::fs::create_dir_all(dir.path().join("HIH")).unwrap();
        std::fs::write(dir.path().join("RC/policies/remote.md"), "remote work").unwrap();
        std::fs::write(dir.path().join("RC/a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("RC/image.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(dir.path().join("stray.txt"), "not a tenant").unwrap();

        let s = storage(&dir);
        assert_eq!(s.tenants().unwrap(), vec!["HIH", "RC"]);
        let docs = s.list("RC").unwrap();
        let paths: Vec<&str> = docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "policies/remote.md"]);
        assert_eq!(docs[0].size, 5);
        assert!(s.list("HIH").unwrap().is_empty());
        assert!(s.list("NEW").unwrap().is_empty());
    }

    #[test]
    fn write_with_sidecar_is_listed_with_url() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        s.write("RC", "page.txt", b"hello", Some("https://example.gov/page"))
            .unwrap();
        let docs = s.list("RC").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_url.as_deref(), Some("https://example.gov/page"));
        assert_eq!(s.read("RC", "page.txt").unwrap(), b"hello");
    }

    #[test]
    fn stat_and_hash() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        s.write("RC", "a.txt", b"abc", None).unwrap();
        let sig = s.stat("RC", "a.txt").unwrap().unwrap();
        assert_eq!(sig.size, 3);
        assert!(s.stat("RC", "gone.txt").unwrap().is_none());
        assert_eq!(
            s.hash("RC", "a.txt").unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn rejects_path_escapes() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        assert!(s.read("RC", "../secret.txt").is_err());
        assert!(s.write("../x", "a.txt", b"", None).is_err());
        assert!(s.write("RC", "sub/a.txt", b"", None).is_err());
        assert!(validate_tenant_id("RC-2_b").is_ok());
        assert!(validate_tenant_id("").is_err());
    }

    #[test]
    fn remove_tenant_deletes_root() {
        let dir = TempDir::new().unwrap();
        let s = storage(&dir);
        s.write("RC", "a.txt", b"abc", None).unwrap();
        s.remove_tenant("RC").unwrap();
        assert!(s.tenants().unwrap().is_empty());
    }
}
