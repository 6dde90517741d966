use super::retry::with_retry;
use super::{
    ByteStream, FileSpaceError, Readable, Result, ScanRules, Scannable, Writeable,
    IO_TIMEOUT_SECS, MAX_ATTEMPTS, OP_TIMEOUT_SECS,
};
use crate::config::{AzureCredentials, S3Credentials};
use crate::core::snapshot::{truncate_to_seconds, FileEntry, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{StreamExt, TryStreamExt};
use opendal::{layers::TimeoutLayer, Entry, Metadata, Metakey, Operator};
use regex::Regex;
use std::time::Duration;
use tracing::{debug, info};

/// 保存原始修改时间（毫秒）的用户元数据键
pub const LMD_KEY: &str = "lmd";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// 对象存储（S3 / Azure Blob）
///
/// 目录以 `dir/` 形式的占位对象表示。
pub struct ObjectFileSpace {
    operator: Operator,
    rules: ScanRules,
    name: String,
}

/// 拆分 `scheme://bucket/prefix` 为 (bucket, prefix)
fn split_uri(uri: &str, scheme: &str) -> Result<(String, String)> {
    let rest = uri
        .get(scheme.len()..)
        .ok_or_else(|| FileSpaceError::Init(format!("无效的路径: {}", uri)))?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(FileSpaceError::Init(format!("路径缺少存储桶/容器: {}", uri)));
    }
    Ok((bucket.to_string(), prefix.trim_matches('/').to_string()))
}

/// opendal 的 root，总是以 `/` 开头和结尾
fn operator_root(prefix: &str, suffix: Option<&str>) -> String {
    let joined: Vec<&str> = [prefix, suffix.unwrap_or("")]
        .into_iter()
        .flat_map(|part| part.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect();
    if joined.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", joined.join("/"))
    }
}

fn with_timeouts(operator: Operator) -> Operator {
    operator
        .layer(
            TimeoutLayer::default()
                .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
        )
}

fn s3_operator(bucket: &str, root: &str, creds: &S3Credentials) -> Result<Operator> {
    use opendal::services::S3;

    let mut builder = S3::default()
        .bucket(bucket)
        .region(&creds.region)
        .access_key_id(&creds.access_key)
        .secret_access_key(&creds.secret_key)
        .root(root);

    if let Some(ref ep) = creds.endpoint {
        builder = builder.endpoint(ep);
    }

    Ok(with_timeouts(Operator::new(builder)?.finish()))
}

fn azure_operator(container: &str, root: &str, creds: &AzureCredentials) -> Result<Operator> {
    use opendal::services::Azblob;

    let endpoint = creds
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", creds.account_name));

    let builder = Azblob::default()
        .container(container)
        .account_name(&creds.account_name)
        .account_key(&creds.account_key)
        .endpoint(&endpoint)
        .root(root);

    Ok(with_timeouts(Operator::new(builder)?.finish()))
}

/// 根据元数据取修改时间：优先用户元数据中的 lmd
fn modified_time(meta: &Metadata) -> Option<DateTime<Utc>> {
    let from_lmd = meta
        .user_metadata()
        .and_then(|m| m.get(LMD_KEY))
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

    from_lmd.or_else(|| meta.last_modified()).map(truncate_to_seconds)
}

/// 路径本身或任一上级目录命中规则
fn is_skipped(rules: &ScanRules, relative_path: &str, is_dir: bool, filters: &[Regex]) -> bool {
    let mut ancestor = String::new();
    let segments: Vec<&str> = relative_path.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !ancestor.is_empty() {
            ancestor.push('/');
        }
        ancestor.push_str(segment);
        let last = i == segments.len() - 1;
        if rules.should_skip(&ancestor, !last || is_dir, filters) {
            return true;
        }
    }
    false
}

fn parent_directories(relative_path: &str) -> impl Iterator<Item = &str> {
    relative_path
        .match_indices('/')
        .map(move |(i, _)| &relative_path[..i])
}

impl ObjectFileSpace {
    pub async fn s3(
        uri: &str,
        suffix: Option<&str>,
        creds: &S3Credentials,
        excludes: Vec<String>,
    ) -> Result<Self> {
        let (bucket, prefix) = split_uri(uri, "s3://")?;
        let raw = s3_operator(&bucket, &operator_root(&prefix, None), creds)?;
        let operator = s3_operator(&bucket, &operator_root(&prefix, suffix), creds)?;
        Self::open(raw, operator, suffix, format!("s3://{}", bucket), excludes).await
    }

    pub async fn azure(
        uri: &str,
        suffix: Option<&str>,
        creds: &AzureCredentials,
        excludes: Vec<String>,
    ) -> Result<Self> {
        let (container, prefix) = split_uri(uri, "azure://")?;
        let raw = azure_operator(&container, &operator_root(&prefix, None), creds)?;
        let operator = azure_operator(&container, &operator_root(&prefix, suffix), creds)?;
        Self::open(raw, operator, suffix, format!("azure://{}", container), excludes).await
    }

    /// 检查原始根可访问，并创建 `<suffix>/` 子根
    async fn open(
        raw: Operator,
        operator: Operator,
        suffix: Option<&str>,
        location: String,
        excludes: Vec<String>,
    ) -> Result<Self> {
        raw.check()
            .await
            .map_err(|e| FileSpaceError::Init(format!("无法访问 {}: {}", location, e)))?;

        if let Some(suffix) = suffix {
            let marker = format!("{}/", suffix.trim_matches('/'));
            if !raw.is_exist(&marker).await? {
                info!("创建子目录 {}{}", location, operator.info().root());
                raw.create_dir(&marker).await?;
            }
        }

        let name = format!("{}{}", location, operator.info().root());
        Ok(Self {
            operator,
            rules: ScanRules::new(excludes),
            name,
        })
    }

    async fn list_all(&self) -> opendal::Result<Vec<Entry>> {
        self.operator
            .lister_with("")
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?
            .try_collect()
            .await
    }

    async fn stat(&self, path: &str) -> Result<Metadata> {
        let what = format!("读取元数据 {}", path);
        Ok(with_retry(&what, MAX_ATTEMPTS, RETRY_BASE_DELAY, || self.operator.stat(path)).await?)
    }

    fn marker(path: &str) -> String {
        format!("{}/", path.trim_end_matches('/'))
    }
}

#[async_trait]
impl Scannable for ObjectFileSpace {
    async fn scan(&self, filters: &[Regex]) -> Result<Snapshot> {
        let what = format!("列出 {}", self.name);
        let entries = with_retry(&what, MAX_ATTEMPTS, RETRY_BASE_DELAY, || self.list_all()).await?;

        let mut snapshot = Snapshot::new();
        snapshot.record_directory("");

        for entry in entries {
            let path = entry.path().trim_start_matches('/');
            if path.is_empty() {
                continue;
            }

            if path.ends_with('/') {
                let dir = path.trim_end_matches('/');
                if !is_skipped(&self.rules, dir, true, filters) {
                    debug!("扫描 {}", dir);
                    for parent in parent_directories(dir) {
                        snapshot.record_directory(parent);
                    }
                    snapshot.record_directory(dir);
                }
                continue;
            }

            if is_skipped(&self.rules, path, false, filters) {
                continue;
            }

            let meta = self.stat(path).await?;
            let modified = modified_time(&meta)
                .ok_or_else(|| FileSpaceError::NotFound(format!("{} 没有修改时间", path)))?;

            for parent in parent_directories(path) {
                snapshot.record_directory(parent);
            }
            snapshot.record_file(&FileEntry::new(path, meta.content_length(), modified));
        }

        Ok(snapshot)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Readable for ObjectFileSpace {
    async fn read_file(&self, path: &str) -> Result<ByteStream> {
        let stream = self
            .operator
            .reader(path)
            .await?
            .into_bytes_stream(..)
            .await?;
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Writeable for ObjectFileSpace {
    async fn create_directory(&self, path: &str) -> Result<()> {
        self.operator.create_dir(&Self::marker(path)).await?;
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        self.operator.delete(&Self::marker(path)).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        // 删除不存在的对象不会报错
        self.operator.delete(path).await?;
        Ok(())
    }

    async fn write_file(&self, stream: Option<ByteStream>, entry: &FileEntry) -> Result<()> {
        let mut stream =
            stream.ok_or_else(|| FileSpaceError::MissingStream(entry.relative_path.clone()))?;
        let path = entry.relative_path.as_str();
        let lmd = entry.modified.timestamp_millis().to_string();

        let mut writer = self
            .operator
            .writer_with(path)
            .user_metadata([(LMD_KEY.to_string(), lmd)])
            .await?;

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            written += chunk.len() as u64;
            writer.write(chunk).await?;
        }
        writer.close().await?;

        let meta = self.stat(path).await?;
        if modified_time(&meta) != Some(entry.modified) {
            return Err(FileSpaceError::TimestampMismatch(entry.relative_path.clone()));
        }
        if written != entry.file_size || meta.content_length() != entry.file_size {
            return Err(FileSpaceError::SizeMismatch {
                path: entry.relative_path.clone(),
                expected: entry.file_size,
                written,
            });
        }

        Ok(())
    }

    fn supports_move(&self) -> bool {
        true
    }

    /// 复制后删除原对象（复制会保留用户元数据）
    async fn move_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.operator.copy(old_path, new_path).await?;
        self.operator.delete(old_path).await?;
        Ok(())
    }
}
