//! 快照数据模型 - 某一时刻存储空间内的文件与目录清单

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;

/// 截断到整秒（不同存储的时间精度不一致）
pub fn truncate_to_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_nanosecond(0).unwrap_or(time)
}

/// SystemTime 转为截断后的 UTC 时间
pub fn from_system_time(time: SystemTime) -> DateTime<Utc> {
    truncate_to_seconds(DateTime::<Utc>::from(time))
}

/// 文件签名
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub file_name: String,
    pub relative_path: String,
    pub file_size: u64,
    pub modified: DateTime<Utc>,
    /// 仅 MOVED 结果会设置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_path: Option<String>,
}

/// 内容签名：文件名 + 大小 + 修改时间，不含路径
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentSignature {
    pub file_name: String,
    pub file_size: u64,
    pub modified: DateTime<Utc>,
}

impl FileEntry {
    /// 文件名取相对路径的最后一段
    pub fn new(relative_path: impl Into<String>, file_size: u64, modified: DateTime<Utc>) -> Self {
        let relative_path = relative_path.into();
        let file_name = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path.as_str())
            .to_string();

        Self {
            file_name,
            relative_path,
            file_size,
            modified: truncate_to_seconds(modified),
            previous_path: None,
        }
    }

    pub fn signature(&self) -> ContentSignature {
        ContentSignature {
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            modified: self.modified,
        }
    }

    /// 内容相等（忽略路径）
    pub fn same_content(&self, other: &FileEntry) -> bool {
        self.file_name == other.file_name
            && self.file_size == other.file_size
            && self.modified == other.modified
    }

    /// 同一内容换到新路径
    pub fn relocated(&self, new_path: &str) -> FileEntry {
        let mut entry = FileEntry::new(new_path, self.file_size, self.modified);
        entry.file_name = self.file_name.clone();
        entry
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.relative_path,
            crate::utils::readable_file_size(self.file_size),
            self.modified.format("%Y-%m-%d %H:%M:%S")
        )?;
        if let Some(previous) = &self.previous_path {
            write!(f, " <- {}", previous)?;
        }
        Ok(())
    }
}

/// 存储空间快照
///
/// 扫描或从缓存加载得到后视为不可变；作为缓存镜像时由同步引擎就地修改。
/// 根目录用空字符串表示。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    captured_at: DateTime<Utc>,
    files: BTreeMap<String, FileEntry>,
    directories: BTreeSet<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            captured_at: truncate_to_seconds(Utc::now()),
            files: BTreeMap::new(),
            directories: BTreeSet::new(),
        }
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn files(&self) -> &BTreeMap<String, FileEntry> {
        &self.files
    }

    pub fn directories(&self) -> &BTreeSet<String> {
        &self.directories
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// 所有文件大小之和
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.file_size).sum()
    }

    // ============ 缓存镜像操作 ============

    /// 记录目录；路径已被文件占用时拒绝
    pub fn record_directory(&mut self, path: &str) -> bool {
        if self.files.contains_key(path) {
            return false;
        }
        self.directories.insert(path.to_string())
    }

    pub fn forget_directory(&mut self, path: &str) -> bool {
        self.directories.remove(path)
    }

    /// 记录（新增或覆盖）文件
    pub fn record_file(&mut self, entry: &FileEntry) -> bool {
        if self.directories.contains(&entry.relative_path) {
            return false;
        }
        let mut entry = entry.clone();
        entry.previous_path = None;
        self.files.insert(entry.relative_path.clone(), entry);
        true
    }

    pub fn forget_file(&mut self, path: &str) -> Option<FileEntry> {
        self.files.remove(path)
    }

    /// 重命名文件，旧路径不存在时返回 false
    pub fn rename_file(&mut self, old_path: &str, new_path: &str) -> bool {
        if self.directories.contains(new_path) {
            return false;
        }
        match self.files.remove(old_path) {
            Some(file) => {
                let moved = file.relocated(new_path);
                self.files.insert(new_path.to_string(), moved);
                true
            }
            None => false,
        }
    }
}
