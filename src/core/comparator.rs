use crate::core::snapshot::{ContentSignature, FileEntry, Snapshot};
use crate::utils::readable_file_size;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use tracing::debug;

/// 差异类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffType {
    Added,
    Deleted,
    Changed,
    Moved,
}

impl DiffType {
    pub const ALL: [DiffType; 4] = [
        DiffType::Added,
        DiffType::Deleted,
        DiffType::Changed,
        DiffType::Moved,
    ];
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffType::Added => write!(f, "ADDED"),
            DiffType::Deleted => write!(f, "DELETED"),
            DiffType::Changed => write!(f, "CHANGED"),
            DiffType::Moved => write!(f, "MOVED"),
        }
    }
}

/// 两个快照之间的差异
#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub added: Vec<FileEntry>,
    pub deleted: Vec<FileEntry>,
    /// 源端版本（需要写入的版本）
    pub changed: Vec<FileEntry>,
    /// 目标端新位置，previous_path 为旧位置
    pub moved: Vec<FileEntry>,
    pub added_dirs: BTreeSet<String>,
    pub deleted_dirs: BTreeSet<String>,
    pub stat: Stat,
}

impl Diff {
    pub fn files(&self, typ: DiffType) -> &[FileEntry] {
        match typ {
            DiffType::Added => &self.added,
            DiffType::Deleted => &self.deleted,
            DiffType::Changed => &self.changed,
            DiffType::Moved => &self.moved,
        }
    }

    /// 目录只有 ADDED / DELETED 两类
    pub fn directories(&self, typ: DiffType) -> Option<&BTreeSet<String>> {
        match typ {
            DiffType::Added => Some(&self.added_dirs),
            DiffType::Deleted => Some(&self.deleted_dirs),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.deleted.is_empty()
            && self.changed.is_empty()
            && self.moved.is_empty()
            && self.added_dirs.is_empty()
            && self.deleted_dirs.is_empty()
    }
}

impl fmt::Display for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[FILES]")?;
        for typ in DiffType::ALL {
            writeln!(f, "{}:", typ)?;
            for file in self.files(typ) {
                writeln!(f, "    {}", file)?;
            }
        }

        writeln!(f, "[DIRECTORIES]")?;
        for typ in [DiffType::Added, DiffType::Deleted] {
            writeln!(f, "{}:", typ)?;
            for dir in self.directories(typ).into_iter().flatten() {
                writeln!(f, "    {}", dir)?;
            }
        }
        Ok(())
    }
}

/// 大小统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// 源端所有文件大小之和
    pub source_size: u64,
    /// CHANGED 文件（源端版本）大小之和
    pub update_size: u64,
    /// 需要传输的字节数 = 新增 + 更新
    pub transfer_size: u64,
    /// 目标端空间变化，可能为负
    pub new_space_size: i64,
}

impl Stat {
    pub fn compute(source: &Snapshot, target: &Snapshot, diff: &Diff) -> Self {
        let sum = |files: &[FileEntry]| files.iter().map(|f| f.file_size).sum::<u64>();

        let added_size = sum(&diff.added);
        let deleted_size = sum(&diff.deleted);
        let update_size = sum(&diff.changed);
        // 被覆盖的旧版本大小
        let replaced_size: u64 = diff
            .changed
            .iter()
            .filter_map(|f| target.file(&f.relative_path))
            .map(|f| f.file_size)
            .sum();

        Self {
            source_size: source.total_size(),
            update_size,
            transfer_size: added_size + update_size,
            new_space_size: added_size as i64 - deleted_size as i64
                + (update_size as i64 - replaced_size as i64),
        }
    }

    pub fn merge(&self, other: &Stat) -> Stat {
        Stat {
            source_size: self.source_size + other.source_size,
            update_size: self.update_size + other.update_size,
            transfer_size: self.transfer_size + other.transfer_size,
            new_space_size: self.new_space_size + other.new_space_size,
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.new_space_size < 0 { "-" } else { "" };
        write!(
            f,
            "源大小={}, 更新={}, 新增占用={}{}, 传输={}",
            readable_file_size(self.source_size),
            readable_file_size(self.update_size),
            sign,
            readable_file_size(self.new_space_size.unsigned_abs()),
            readable_file_size(self.transfer_size)
        )
    }
}

/// 比较两个快照，返回把目标变成源所需的差异
///
/// `detect_moves` 为 true 时，内容签名相同的 DELETED/ADDED 会配对成 MOVED。
/// 签名冲突（同名同大小同时间的不同文件）时配对结果只保证是合法配对之一。
pub fn diff(source: &Snapshot, target: &Snapshot, detect_moves: bool) -> Diff {
    let mut result = Diff::default();

    for (path, target_file) in target.files() {
        match source.file(path) {
            Some(source_file) => {
                if !source_file.same_content(target_file) {
                    result.changed.push(source_file.clone());
                }
            }
            None => result.deleted.push(target_file.clone()),
        }
    }

    for (path, source_file) in source.files() {
        if target.file(path).is_none() {
            result.added.push(source_file.clone());
        }
    }

    if detect_moves {
        pair_moves(&mut result);
    }

    result.added_dirs = source
        .directories()
        .difference(target.directories())
        .cloned()
        .collect();
    result.deleted_dirs = target
        .directories()
        .difference(source.directories())
        .cloned()
        .collect();

    result.stat = Stat::compute(source, target, &result);

    debug!(
        "差异: 新增 {}, 删除 {}, 修改 {}, 移动 {}, 新目录 {}, 删除目录 {}",
        result.added.len(),
        result.deleted.len(),
        result.changed.len(),
        result.moved.len(),
        result.added_dirs.len(),
        result.deleted_dirs.len()
    );

    result
}

/// 按内容签名把 DELETED 和 ADDED 逐个配对
fn pair_moves(result: &mut Diff) {
    let mut deleted_by_signature: HashMap<ContentSignature, VecDeque<FileEntry>> = HashMap::new();
    for file in result.deleted.drain(..) {
        deleted_by_signature
            .entry(file.signature())
            .or_default()
            .push_back(file);
    }

    let mut still_added = Vec::with_capacity(result.added.len());
    for file in result.added.drain(..) {
        let origin = deleted_by_signature
            .get_mut(&file.signature())
            .and_then(|queue| queue.pop_front());

        match origin {
            Some(origin) => {
                let mut moved = file;
                moved.previous_path = Some(origin.relative_path);
                result.moved.push(moved);
            }
            None => still_added.push(file),
        }
    }
    result.added = still_added;

    let mut still_deleted: Vec<FileEntry> = deleted_by_signature.into_values().flatten().collect();
    still_deleted.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    result.deleted = still_deleted;
}
