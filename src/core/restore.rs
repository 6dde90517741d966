//! 恢复：把目标端 `<root>/<name>` 当作源，同步回本地 `<path>/<name>`

use super::cache::SnapshotCache;
use super::engine::{sync_source, SyncReport};
use crate::config::{Credentials, ProfileConfig, SourceConfig, TargetConfig};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// 恢复时使用的 (源, 目标) 配置
///
/// 源沿用目标端的凭据和缓存设置；目标为本地路径，不缓存。
pub fn restore_configs(
    target: &TargetConfig,
    restore_to: &str,
    source_name: &str,
) -> (SourceConfig, TargetConfig) {
    let root = target.path.trim_end_matches('/');
    let source = SourceConfig {
        name: source_name.to_string(),
        path: format!("{}/{}", root, source_name),
        excludes: Vec::new(),
        filters: Vec::new(),
        cache_days: target.cache_days,
        credentials: target.credentials.clone(),
    };
    let restore_target = TargetConfig {
        path: restore_to.to_string(),
        cache_days: None,
        credentials: Credentials::default(),
    };
    (source, restore_target)
}

/// 恢复单个源
pub async fn restore_source(
    target: &TargetConfig,
    restore_to: &Path,
    source_name: &str,
    cache: Arc<SnapshotCache>,
) -> Result<SyncReport> {
    if !restore_to.exists() {
        std::fs::create_dir_all(restore_to)
            .with_context(|| format!("无法创建恢复目录: {}", restore_to.display()))?;
    }

    let restore_to = restore_to.to_string_lossy();
    let (source, restore_target) = restore_configs(target, &restore_to, source_name);
    info!("[{}] 开始恢复 {} -> {}/{}", source_name, source.path, restore_to, source_name);
    sync_source(&source, &restore_target, cache).await
}

/// 依次恢复所有源
pub async fn restore_profile(profile: &ProfileConfig, restore_to: &Path) -> SyncReport {
    let cache = Arc::new(SnapshotCache::new(profile.cache_dir()));
    let mut total = SyncReport::default();

    for source in &profile.sources {
        match restore_source(&profile.target, restore_to, &source.name, cache.clone()).await {
            Ok(report) => total.merge(&report),
            Err(e) => error!("[{}] 恢复中止: {:#}", source.name, e),
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S3Credentials;
    use filetime::FileTime;

    #[test]
    fn test_restore_configs_swap_roles() {
        let target = TargetConfig {
            path: "s3://bucket/backup/".to_string(),
            cache_days: Some(7),
            credentials: Credentials {
                s3: Some(S3Credentials {
                    access_key: "ak".to_string(),
                    secret_key: "sk".to_string(),
                    region: "eu-west-1".to_string(),
                    endpoint: None,
                }),
                ..Default::default()
            },
        };

        let (source, restore_target) = restore_configs(&target, "/restore", "docs");
        assert_eq!(source.path, "s3://bucket/backup/docs");
        assert_eq!(source.cache_days, Some(7));
        assert!(source.credentials.s3.is_some());
        assert!(source.excludes.is_empty());
        assert_eq!(restore_target.path, "/restore");
        assert_eq!(restore_target.cache_days, None);
    }

    #[tokio::test]
    async fn test_restore_creates_missing_directory() {
        let backup_dir = tempfile::tempdir().unwrap();
        let restore_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let file = backup_dir.path().join("docs/sub/a.txt");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"restored").unwrap();
        filetime::set_file_mtime(&file, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let target = TargetConfig {
            path: backup_dir.path().to_string_lossy().into_owned(),
            cache_days: None,
            credentials: Credentials::default(),
        };
        let restore_to = restore_dir.path().join("nested/place");
        let cache = Arc::new(SnapshotCache::new(cache_dir.path().to_path_buf()));

        let report = restore_source(&target, &restore_to, "docs", cache).await.unwrap();
        assert_eq!(report.files_transferred, 1);
        assert_eq!(
            std::fs::read(restore_to.join("docs/sub/a.txt")).unwrap(),
            b"restored"
        );
    }
}
