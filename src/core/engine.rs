use crate::config::{ProfileConfig, SourceConfig, TargetConfig};
use crate::core::analyzer::{Analyzer, Spaces};
use crate::core::cache::{CacheSlot, SnapshotCache};
use crate::core::comparator::{Diff, Stat};
use crate::core::snapshot::{FileEntry, Snapshot};
use crate::storage::{SourceSpace, TargetSpace};
use crate::utils::{readable_file_size, readable_transfer_rate};
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 同步报告
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub directories_created: u32,
    pub files_transferred: u32,
    pub files_deleted: u32,
    pub files_moved: u32,
    pub directories_deleted: u32,
    pub failed: u32,
    pub bytes_transferred: u64,
}

impl SyncReport {
    pub fn merge(&mut self, other: &SyncReport) {
        self.directories_created += other.directories_created;
        self.files_transferred += other.files_transferred;
        self.files_deleted += other.files_deleted;
        self.files_moved += other.files_moved;
        self.directories_deleted += other.directories_deleted;
        self.failed += other.failed;
        self.bytes_transferred += other.bytes_transferred;
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "新建目录 {}, 传输 {} 个文件 ({}), 删除 {} 个文件, 移动 {} 个文件, 删除目录 {}, 失败 {}",
            self.directories_created,
            self.files_transferred,
            readable_file_size(self.bytes_transferred),
            self.files_deleted,
            self.files_moved,
            self.directories_deleted,
            self.failed
        )
    }
}

/// 把差异应用到目标端
///
/// 每个成功的操作都同步到 `mirror`（目标端快照的副本），失败的操作只记录日志，
/// 下次运行时会重新比较。
pub struct Syncer<'a> {
    source: Arc<dyn SourceSpace>,
    target: Arc<dyn TargetSpace>,
    mirror: &'a mut Snapshot,
    cache: Option<CacheSlot>,
}

impl<'a> Syncer<'a> {
    pub fn new(
        source: Arc<dyn SourceSpace>,
        target: Arc<dyn TargetSpace>,
        mirror: &'a mut Snapshot,
    ) -> Self {
        Self {
            source,
            target,
            mirror,
            cache: None,
        }
    }

    /// 完成后把镜像保存到缓存（缓存未启用时忽略）
    pub fn with_cache(mut self, slot: CacheSlot) -> Self {
        self.cache = Some(slot);
        self
    }

    pub async fn apply(mut self, diff: &Diff) -> SyncReport {
        let mut report = SyncReport::default();

        // 1. 新建目录（父目录在前）
        for dir in &diff.added_dirs {
            match self.target.create_directory(dir).await {
                Ok(()) => {
                    debug!("新建目录: {}", dir);
                    self.mirror.record_directory(dir);
                    report.directories_created += 1;
                }
                Err(e) => {
                    error!("新建目录失败 {}: {}", dir, e);
                    report.failed += 1;
                }
            }
        }

        // 2. 传输新增和修改的文件
        for entry in diff.added.iter().chain(diff.changed.iter()) {
            match self.transfer(entry).await {
                Ok(()) => {
                    self.mirror.record_file(entry);
                    report.files_transferred += 1;
                    report.bytes_transferred += entry.file_size;
                }
                Err(e) => {
                    error!("传输失败 {}: {}", entry.relative_path, e);
                    report.failed += 1;
                }
            }
        }

        // 3. 删除文件
        for entry in &diff.deleted {
            match self.target.delete_file(&entry.relative_path).await {
                Ok(()) => {
                    info!("删除: {}", entry.relative_path);
                    self.mirror.forget_file(&entry.relative_path);
                    report.files_deleted += 1;
                }
                Err(e) => {
                    error!("删除失败 {}: {}", entry.relative_path, e);
                    report.failed += 1;
                }
            }
        }

        // 4. 移动文件
        if !diff.moved.is_empty() && !self.target.supports_move() {
            warn!(
                "{} 不支持移动，跳过 {} 个文件",
                self.target.name(),
                diff.moved.len()
            );
        } else {
            for entry in &diff.moved {
                if self.relocate(entry).await {
                    report.files_moved += 1;
                } else {
                    report.failed += 1;
                }
            }
        }

        // 5. 删除目录（子目录在前）
        for dir in diff.deleted_dirs.iter().rev() {
            match self.target.delete_directory(dir).await {
                Ok(()) => {
                    debug!("删除目录: {}", dir);
                    self.mirror.forget_directory(dir);
                    report.directories_deleted += 1;
                }
                Err(e) => {
                    error!("删除目录失败 {}: {}", dir, e);
                    report.failed += 1;
                }
            }
        }

        // 6. 保存镜像
        if let Some(slot) = &self.cache {
            if let Err(e) = slot.save(self.mirror) {
                warn!("保存缓存失败: {:#}", e);
            }
        }

        report
    }

    async fn transfer(&self, entry: &FileEntry) -> crate::storage::Result<()> {
        let start = Instant::now();
        let stream = match self.source.read_file(&entry.relative_path).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("无法读取源文件 {}: {}", entry.relative_path, e);
                None
            }
        };

        self.target.write_file(stream, entry).await?;

        info!(
            "传输: {} ({}, {})",
            entry.relative_path,
            readable_file_size(entry.file_size),
            readable_transfer_rate(entry.file_size, start.elapsed())
        );
        Ok(())
    }

    async fn relocate(&mut self, entry: &FileEntry) -> bool {
        let Some(old_path) = entry.previous_path.as_deref() else {
            error!("移动缺少原路径: {}", entry.relative_path);
            return false;
        };

        match self.target.move_file(old_path, &entry.relative_path).await {
            Ok(()) => {
                info!("移动: {} -> {}", old_path, entry.relative_path);
                self.mirror.rename_file(old_path, &entry.relative_path);
                true
            }
            Err(e) => {
                error!("移动失败 {} -> {}: {}", old_path, entry.relative_path, e);
                false
            }
        }
    }
}

/// 分析并同步单个源
pub async fn sync_source(
    source: &SourceConfig,
    target: &TargetConfig,
    cache: Arc<SnapshotCache>,
) -> Result<SyncReport> {
    let analyzer = Analyzer::new(source.clone(), target.clone(), cache);
    let spaces = analyzer.connect().await?;
    let report = sync_spaces(&analyzer, &spaces).await?;

    info!("[{}] 同步完成: {}", source.name, report);
    Ok(report)
}

/// 在已初始化的两端上分析并应用差异；任何一端扫描失败时不做修改
pub async fn sync_spaces(analyzer: &Analyzer, spaces: &Spaces) -> Result<SyncReport> {
    let analysis = analyzer.analyze(spaces).await?;

    // 在副本上同步，分析得到的快照保持不变
    let mut mirror = analysis.target.clone();
    Ok(
        Syncer::new(spaces.source.clone(), spaces.target.clone(), &mut mirror)
            .with_cache(analyzer.target_slot())
            .apply(&analysis.diff)
            .await,
    )
}

/// 分析单个源，返回差异
pub async fn analyze_source(
    source: &SourceConfig,
    target: &TargetConfig,
    cache: Arc<SnapshotCache>,
) -> Result<Diff> {
    let analyzer = Analyzer::new(source.clone(), target.clone(), cache);
    let spaces = analyzer.connect().await?;
    Ok(analyzer.analyze(&spaces).await?.diff)
}

/// 依次同步所有源，单个源失败不影响其它源
pub async fn sync_profile(profile: &ProfileConfig) -> SyncReport {
    let cache = Arc::new(SnapshotCache::new(profile.cache_dir()));
    let mut total = SyncReport::default();

    for source in &profile.sources {
        info!("[{}] 开始同步 {} -> {}", source.name, source.path, profile.target.path);
        match sync_source(source, &profile.target, cache.clone()).await {
            Ok(report) => total.merge(&report),
            Err(e) => error!("[{}] 同步中止: {:#}", source.name, e),
        }
    }

    total
}

/// 依次分析所有源，返回 (源名称, 差异) 列表和合计统计
pub async fn analyze_profile(profile: &ProfileConfig) -> (Vec<(String, Diff)>, Stat) {
    let cache = Arc::new(SnapshotCache::new(profile.cache_dir()));
    let mut results = Vec::new();
    let mut total = Stat::default();

    for source in &profile.sources {
        match analyze_source(source, &profile.target, cache.clone()).await {
            Ok(diff) => {
                total = total.merge(&diff.stat);
                results.push((source.name.clone(), diff));
            }
            Err(e) => error!("[{}] 分析中止: {:#}", source.name, e),
        }
    }

    (results, total)
}
