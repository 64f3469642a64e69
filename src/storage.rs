use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::{Backend, StorageConfig};
use crate::error::{PipelineError, Result};

// ============================
// 1. 数据结构
// ============================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: u64,
    pub etag: Option<String>,
}

/// The four object-store calls the pipeline makes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// At most `limit` objects under `prefix`, directory markers excluded.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str, dest: &Path) -> Result<Fetched>;

    async fn put(&self, src: &Path, key: &str) -> Result<()>;

    fn location(&self) -> String;
}

pub async fn connect(config: &StorageConfig) -> Box<dyn ObjectStore> {
    match &config.backend {
        Backend::S3 {
            bucket,
            region,
            endpoint,
        } => Box::new(S3Store::connect(bucket, region.clone(), endpoint.clone()).await),
        Backend::Local { root } => Box::new(LocalStore::new(root.clone())),
    }
}

// ============================
// 2. S3
// ============================

pub struct S3Store {
    bucket: String,
    client: Client,
}

impl S3Store {
    pub async fn connect(bucket: &str, region: Option<String>, endpoint: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!("🪣 S3 storage initialized: bucket={}", bucket);
        Self {
            bucket: bucket.to_string(),
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| PipelineError::Listing {
                    prefix: prefix.to_string(),
                    message: DisplayErrorContext(&e).to_string(),
                })?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                if key.ends_with('/') {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                });
                if objects.len() >= limit {
                    return Ok(objects);
                }
            }

            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(PipelineError::Storage {
                        key: key.to_string(),
                        message: DisplayErrorContext(&err).to_string(),
                    })
                }
            }
        }
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<Fetched> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| PipelineError::Storage {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        let etag = resp.e_tag().map(|s| s.to_string());
        let mut body = resp.body;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| PipelineError::io(dest, e))?;

        let mut bytes = 0u64;
        while let Some(chunk) = body.try_next().await.map_err(|e| PipelineError::Storage {
            key: key.to_string(),
            message: e.to_string(),
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::io(dest, e))?;
            bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| PipelineError::io(dest, e))?;

        debug!("Fetched s3://{}/{} ({} bytes)", self.bucket, key, bytes);
        Ok(Fetched { bytes, etag })
    }

    async fn put(&self, src: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| PipelineError::Storage {
                key: key.to_string(),
                message: format!("cannot read {}: {}", src.display(), e),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::Storage {
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!("Uploaded {} to s3://{}/{}", src.display(), self.bucket, key);
        Ok(())
    }

    fn location(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

// ============================
// 3. Local directory mirror
// ============================

/// Keys map to paths relative to `root`. Reports plain MD5 entity tags,
/// like single-part S3 uploads.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(PipelineError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let owned_prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || list_local(&root, &owned_prefix, limit))
            .await
            .map_err(|e| PipelineError::Listing {
                prefix: prefix.to_string(),
                message: e.to_string(),
            })?
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<Fetched> {
        let path = self.path_for(key)?;
        let bytes = tokio::fs::copy(&path, dest)
            .await
            .map_err(|e| PipelineError::Storage {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        let etag = format!("\"{}\"", file_md5(&path).await?);
        Ok(Fetched {
            bytes,
            etag: Some(etag),
        })
    }

    async fn put(&self, src: &Path, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::io(parent, e))?;
        }
        tokio::fs::copy(src, &path)
            .await
            .map_err(|e| PipelineError::Storage {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

fn list_local(root: &Path, prefix: &str, limit: usize) -> Result<Vec<ObjectInfo>> {
    // walk from the deepest directory the prefix names, then filter by string prefix
    let dir_part = match prefix.rfind('/') {
        Some(idx) => &prefix[..idx],
        None => "",
    };

    let mut keys = Vec::new();
    collect_files(root, &root.join(dir_part), &mut keys).map_err(|e| PipelineError::Listing {
        prefix: prefix.to_string(),
        message: e.to_string(),
    })?;
    keys.retain(|k| k.starts_with(prefix));
    keys.sort();
    keys.truncate(limit);

    let mut objects = Vec::with_capacity(keys.len());
    for key in keys {
        let path = root.join(&key);
        let size = fs::metadata(&path)
            .map_err(|e| PipelineError::io(&path, e))?
            .len();
        objects.push(ObjectInfo { key, size });
    }
    Ok(objects)
}

fn collect_files(root: &Path, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, keys)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.push(key);
        }
    }
    Ok(())
}

// ============================
// 4. Integrity
// ============================

pub async fn file_md5(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| PipelineError::io(path, e))?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0; 1024 * 1024 * 4];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// The MD5 carried by an entity tag, if it is a plain one. Multipart tags
/// (`"<hex>-<parts>"`) are not content digests and yield `None`.
pub fn plain_md5_etag(etag: &str) -> Option<String> {
    let tag = etag.trim().trim_matches('"');
    if tag.len() == 32 && tag.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(tag.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> (tempfile::TempDir, LocalStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("sra/nested")).unwrap();
        fs::create_dir_all(root.join("reports")).unwrap();
        fs::write(root.join("sra/SRR2.sra"), b"two").unwrap();
        fs::write(root.join("sra/SRR1.sra"), b"one").unwrap();
        fs::write(root.join("sra/nested/SRR3.sra"), b"three").unwrap();
        fs::write(root.join("sra-other.txt"), b"x").unwrap();
        fs::write(root.join("reports/SRR1_report.tsv"), b"r").unwrap();
        let store = LocalStore::new(root);
        (temp, store)
    }

    #[tokio::test]
    async fn local_list_is_sorted_prefixed_and_limited() {
        let (_temp, store) = seeded_store();

        let all = store.list("sra/", 100).await.unwrap();
        let keys: Vec<_> = all.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["sra/SRR1.sra", "sra/SRR2.sra", "sra/nested/SRR3.sra"]);
        assert_eq!(all[2].size, 5);

        let limited = store.list("sra/", 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let missing = store.list("nothing/", 10).await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn local_exists_get_put() {
        let (temp, store) = seeded_store();
        assert!(store.exists("reports/SRR1_report.tsv").await.unwrap());
        assert!(!store.exists("reports/SRR2_report.tsv").await.unwrap());

        let dest = temp.path().join("fetched.sra");
        let fetched = store.get("sra/SRR2.sra", &dest).await.unwrap();
        assert_eq!(fetched.bytes, 3);
        assert_eq!(fs::read(&dest).unwrap(), b"two");
        let etag = fetched.etag.unwrap();
        assert_eq!(plain_md5_etag(&etag), Some(format!("{:x}", md5::compute(b"two"))));

        store.put(&dest, "annotations/deep/SRR2_annot.fa").await.unwrap();
        assert!(store.exists("annotations/deep/SRR2_annot.fa").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_list_from_concurrent_tasks() {
        let (_temp, store) = seeded_store();
        let store = std::sync::Arc::new(store);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.list("sra/", 2).await })
            })
            .collect();
        for handle in handles {
            let objects = handle.await.unwrap().unwrap();
            assert_eq!(objects.len(), 2);
        }
        assert!(store.list("missing/", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_rejects_escaping_keys() {
        let (_temp, store) = seeded_store();
        let err = store.exists("../etc/passwd").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidKey(_)));
    }

    #[test]
    fn multipart_etags_are_not_digests() {
        assert_eq!(
            plain_md5_etag("\"9E107D9D372BB6826BD81D3542A419D6\""),
            Some("9e107d9d372bb6826bd81d3542a419d6".to_string())
        );
        assert_eq!(plain_md5_etag("\"9e107d9d372bb6826bd81d3542a419d6-4\""), None);
        assert_eq!(plain_md5_etag("W/\"abc\""), None);
    }
}
