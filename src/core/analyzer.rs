//! 分析器：并发获取源端和目标端快照并计算差异

use super::cache::{CacheSlot, SnapshotCache};
use super::comparator::{diff, Diff, DiffType};
use super::snapshot::Snapshot;
use crate::config::{SourceConfig, TargetConfig};
use crate::storage::{self, compile_filters, Scannable, SourceSpace, TargetSpace};
use anyhow::{Context, Result};
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// 一次分析的结果
#[derive(Debug, Clone)]
pub struct Analysis {
    pub source: Snapshot,
    pub target: Snapshot,
    pub diff: Diff,
}

/// 已初始化的源端和目标端
pub struct Spaces {
    pub source: Arc<dyn SourceSpace>,
    pub target: Arc<dyn TargetSpace>,
}

pub struct Analyzer {
    source_config: SourceConfig,
    target_config: TargetConfig,
    cache: Arc<SnapshotCache>,
}

impl Analyzer {
    pub fn new(
        source_config: SourceConfig,
        target_config: TargetConfig,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            source_config,
            target_config,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.source_config.name
    }

    pub fn source_slot(&self) -> CacheSlot {
        CacheSlot::new(
            self.cache.clone(),
            &self.source_config.path,
            &self.source_config.name,
            self.source_config.cache_days,
        )
    }

    /// 目标端缓存以目标根路径 + 源名称区分
    pub fn target_slot(&self) -> CacheSlot {
        CacheSlot::new(
            self.cache.clone(),
            &self.target_config.path,
            &self.source_config.name,
            self.target_config.cache_days,
        )
    }

    /// 通过注册表初始化两端存储
    pub async fn connect(&self) -> Result<Spaces> {
        let source = storage::create_source(&self.source_config)
            .await
            .with_context(|| format!("源存储初始化失败: {}", self.source_config.path))?;
        let target = storage::create_target(&self.target_config, &self.source_config.name)
            .await
            .with_context(|| {
                format!(
                    "目标存储初始化失败: {}/{}",
                    self.target_config.path, self.source_config.name
                )
            })?;
        Ok(Spaces { source, target })
    }

    /// 目标端在单独的任务中先开始，源端在当前任务中扫描，两者完成后比较
    pub async fn analyze(&self, spaces: &Spaces) -> Result<Analysis> {
        let filters = compile_filters(&self.source_config.filters)
            .with_context(|| format!("过滤规则无效: {}", self.source_config.name))?;

        let target = spaces.target.clone();
        let target_slot = self.target_slot();
        let target_task = tokio::spawn(async move {
            load_or_scan(target.as_ref(), &[], &target_slot).await
        });

        let source_result = load_or_scan(spaces.source.as_ref(), &filters, &self.source_slot()).await;
        let target_result = target_task.await.context("目标端扫描任务异常退出")?;

        let source = source_result?;
        let target = target_result?;

        let diff = diff(&source, &target, spaces.target.supports_move());
        log_diff(&self.source_config.name, &diff);

        Ok(Analysis {
            source,
            target,
            diff,
        })
    }
}

/// 缓存有效时直接使用，否则扫描并（启用缓存时）保存
async fn load_or_scan<S>(space: &S, filters: &[Regex], slot: &CacheSlot) -> Result<Snapshot>
where
    S: Scannable + ?Sized,
{
    if let Some(snapshot) = slot.load() {
        return Ok(snapshot);
    }

    info!("开始扫描: {}", space.name());
    let start = Instant::now();
    let snapshot = space
        .scan(filters)
        .await
        .with_context(|| format!("扫描失败: {}", space.name()))?;
    info!(
        "扫描完成: {} ({} 个文件, {} 个目录, 耗时 {:.1}s)",
        space.name(),
        snapshot.files().len(),
        snapshot.directories().len(),
        start.elapsed().as_secs_f64()
    );

    if let Err(e) = slot.save(&snapshot) {
        warn!("保存缓存失败: {:#}", e);
    }
    Ok(snapshot)
}

fn log_diff(name: &str, diff: &Diff) {
    for typ in DiffType::ALL {
        let files = diff.files(typ).len();
        let dirs = diff.directories(typ).map_or(0, |d| d.len());
        if files > 0 || dirs > 0 {
            info!("[{}] {}: {} 个文件, {} 个目录", name, typ, files, dirs);
        }
    }
    if diff.is_empty() {
        info!("[{}] 没有差异", name);
    }
}
