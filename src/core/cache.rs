//! 快照缓存
//!
//! 将扫描得到的快照持久化，在有效期内复用，避免每次同步都重新扫描

use super::snapshot::Snapshot;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// 快照缓存管理器
pub struct SnapshotCache {
    cache_dir: PathBuf,
}

impl SnapshotCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        // 确保缓存目录存在
        let _ = std::fs::create_dir_all(&cache_dir);
        Self { cache_dir }
    }

    /// 缓存文件路径：`<根路径中非字母数字替换为 _>_<名称>.snap`
    pub fn cache_path(&self, root: &str, name: &str) -> PathBuf {
        let sanitized: String = root
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.cache_dir.join(format!("{}_{}.snap", sanitized, name))
    }

    /// 加载未过期的快照
    ///
    /// 快照时间加上 `max_age_days` 早于当前时间即过期；文件损坏时删除。
    pub fn load(&self, root: &str, name: &str, max_age_days: u32) -> Option<Snapshot> {
        let path = self.cache_path(root, name);
        if !path.exists() {
            return None;
        }

        let data = std::fs::read(&path).ok()?;
        let snapshot: Snapshot = match serde_json::from_slice(&data) {
            Ok(s) => s,
            Err(e) => {
                // 缓存损坏，删除
                warn!("缓存文件损坏 {:?}: {}", path, e);
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };

        let now = Utc::now();
        let age = (now - snapshot.captured_at()).num_seconds().max(0) as u64;
        if !Self::is_fresh(snapshot.captured_at(), max_age_days, now) {
            info!("缓存已过期 ({})，重新扫描: {}", Self::format_age(age), root);
            return None;
        }

        info!(
            "从缓存加载 {} 个文件 (缓存于 {}): {}",
            snapshot.files().len(),
            Self::format_age(age),
            root
        );
        Some(snapshot)
    }

    /// 恰好到期的快照仍然有效
    fn is_fresh(captured_at: DateTime<Utc>, max_age_days: u32, now: DateTime<Utc>) -> bool {
        captured_at + Duration::days(i64::from(max_age_days)) >= now
    }

    /// 格式化缓存时间
    pub fn format_age(age_seconds: u64) -> String {
        if age_seconds < 60 {
            format!("{}秒前", age_seconds)
        } else if age_seconds < 3600 {
            format!("{}分钟前", age_seconds / 60)
        } else if age_seconds < 86400 {
            format!("{}小时前", age_seconds / 3600)
        } else {
            format!("{}天前", age_seconds / 86400)
        }
    }

    /// 保存快照（先写临时文件再重命名）
    pub fn save(&self, root: &str, name: &str, snapshot: &Snapshot) -> Result<()> {
        let path = self.cache_path(root, name);
        let temp_path = path.with_extension("snap.tmp");

        let data = serde_json::to_vec(snapshot)?;
        std::fs::write(&temp_path, data)
            .with_context(|| format!("无法写入缓存 {:?}", temp_path))?;
        std::fs::rename(&temp_path, &path)
            .with_context(|| format!("无法写入缓存 {:?}", path))?;

        info!("已缓存 {} 个文件到 {:?}", snapshot.files().len(), path);
        Ok(())
    }
}

/// 某个存储空间在缓存中的位置及其有效期
#[derive(Clone)]
pub struct CacheSlot {
    cache: Arc<SnapshotCache>,
    root: String,
    name: String,
    /// 为空表示不缓存
    max_age_days: Option<u32>,
}

impl CacheSlot {
    pub fn new(
        cache: Arc<SnapshotCache>,
        root: impl Into<String>,
        name: impl Into<String>,
        max_age_days: Option<u32>,
    ) -> Self {
        Self {
            cache,
            root: root.into(),
            name: name.into(),
            max_age_days,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_age_days.is_some()
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn load(&self) -> Option<Snapshot> {
        let days = self.max_age_days?;
        self.cache.load(&self.root, &self.name, days)
    }

    /// 未启用缓存时什么也不做
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.cache.save(&self.root, &self.name, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::FileEntry;

    fn snapshot_at(days_ago: i64) -> Snapshot {
        let mut snap = Snapshot::new().with_captured_at(Utc::now() - Duration::days(days_ago));
        snap.record_directory("");
        snap.record_file(&FileEntry::new("a.txt", 1, Utc::now()));
        snap
    }

    #[test]
    fn test_cache_path_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().to_path_buf());

        let path = cache.cache_path("s3://bucket/backup", "docs");
        assert_eq!(path, dir.path().join("s3___bucket_backup_docs.snap"));
    }

    #[test]
    fn test_load_respects_age() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().to_path_buf());

        cache.save("/data", "fresh", &snapshot_at(1)).unwrap();
        cache.save("/data", "stale", &snapshot_at(4)).unwrap();

        let loaded = cache.load("/data", "fresh", 3).unwrap();
        assert_eq!(loaded.files().len(), 1);
        assert!(cache.load("/data", "stale", 3).is_none());
        assert!(cache.load("/data", "missing", 3).is_none());
    }

    #[test]
    fn test_expiry_boundary_is_still_fresh() {
        let captured = Utc::now() - Duration::days(10);

        assert!(SnapshotCache::is_fresh(captured, 3, captured + Duration::days(3)));
        assert!(!SnapshotCache::is_fresh(
            captured,
            3,
            captured + Duration::days(3) + Duration::seconds(1)
        ));
        assert!(SnapshotCache::is_fresh(captured, 0, captured));
    }

    #[test]
    fn test_corrupt_cache_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().to_path_buf());
        let path = cache.cache_path("/data", "docs");
        std::fs::write(&path, b"{ broken").unwrap();

        assert!(cache.load("/data", "docs", 3).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_disabled_slot_never_persists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(SnapshotCache::new(dir.path().to_path_buf()));

        let disabled = CacheSlot::new(cache.clone(), "/data", "docs", None);
        disabled.save(&snapshot_at(0)).unwrap();
        assert!(!cache.cache_path("/data", "docs").exists());
        assert!(disabled.load().is_none());

        let enabled = CacheSlot::new(cache, "/data", "docs", Some(1));
        enabled.save(&snapshot_at(0)).unwrap();
        assert!(enabled.load().is_some());
    }

    #[test]
    fn test_format_age() {
        assert_eq!(SnapshotCache::format_age(30), "30秒前");
        assert_eq!(SnapshotCache::format_age(120), "2分钟前");
        assert_eq!(SnapshotCache::format_age(7200), "2小时前");
        assert_eq!(SnapshotCache::format_age(172800), "2天前");
    }
}
