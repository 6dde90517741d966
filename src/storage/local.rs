use super::{ByteStream, FileSpaceError, Readable, Result, ScanRules, Scannable, Writeable};
use crate::core::snapshot::{from_system_time, FileEntry, Snapshot};
use async_trait::async_trait;
use filetime::FileTime;
use futures::StreamExt;
use regex::Regex;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 本地文件系统（本地操作不重试）
pub struct LocalFileSpace {
    root: PathBuf,
    rules: ScanRules,
    name: String,
}

impl LocalFileSpace {
    /// 打开根目录；`suffix` 不为空时实际根目录为 `<root>/<suffix>`，不存在则创建。
    /// 原始根目录本身必须已经存在。
    pub fn open(root: &str, suffix: Option<&str>, excludes: Vec<String>) -> Result<Self> {
        let trimmed = root.trim_end_matches(['/', '\\']);
        let raw_root = PathBuf::from(if trimmed.is_empty() { root } else { trimmed });
        if !raw_root.is_dir() {
            return Err(FileSpaceError::Init(format!(
                "根目录不存在或不是目录: {}",
                raw_root.display()
            )));
        }

        let root = match suffix {
            Some(suffix) => {
                let root = raw_root.join(suffix);
                std::fs::create_dir_all(&root)?;
                root
            }
            None => raw_root,
        };

        let name = format!("local:{}", root.display());
        Ok(Self {
            root,
            rules: ScanRules::new(excludes),
            name,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |full, segment| full.join(segment))
    }

    /// 规范化为以 / 分隔的相对路径
    fn relative_path(root: &Path, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(root).ok()?.to_str()?;
        Some(relative.replace('\\', "/"))
    }

    /// 写入时使用的临时文件（隐藏文件，扫描时会被跳过）
    fn temp_path(full_path: &Path) -> PathBuf {
        let file_name = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        full_path.with_file_name(format!(".{}.svsync-tmp", file_name))
    }

    /// 符号链接按其指向扫描；循环链接和断开的链接跳过
    fn is_dangling(err: &walkdir::Error) -> bool {
        if err.loop_ancestor().is_some() {
            return true;
        }
        err.path().is_some_and(|path| {
            std::fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink())
                && std::fs::metadata(path).is_err()
        })
    }

    /// 写入临时文件并设置、校验大小与修改时间
    async fn write_temp(
        stream: &mut ByteStream,
        temp_path: &Path,
        entry: &FileEntry,
    ) -> Result<()> {
        let mut file = fs::File::create(temp_path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if written != entry.file_size {
            return Err(FileSpaceError::SizeMismatch {
                path: entry.relative_path.clone(),
                expected: entry.file_size,
                written,
            });
        }

        let mtime = FileTime::from_unix_time(entry.modified.timestamp(), 0);
        filetime::set_file_mtime(temp_path, mtime)?;

        let stored = from_system_time(fs::metadata(temp_path).await?.modified()?);
        if stored != entry.modified {
            return Err(FileSpaceError::TimestampMismatch(entry.relative_path.clone()));
        }

        Ok(())
    }
}

#[async_trait]
impl Scannable for LocalFileSpace {
    async fn scan(&self, filters: &[Regex]) -> Result<Snapshot> {
        let root = self.root.clone();
        let rules = self.rules.clone();
        let filters = filters.to_vec();

        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || -> Result<Snapshot> {
            let mut snapshot = Snapshot::new();
            if !root.exists() {
                return Ok(snapshot);
            }
            snapshot.record_directory("");

            let walker = WalkDir::new(&root)
                .min_depth(1)
                .follow_links(true)
                .into_iter()
                .filter_entry(|entry| match Self::relative_path(&root, entry.path()) {
                    Some(relative) => {
                        !rules.should_skip(&relative, entry.file_type().is_dir(), &filters)
                    }
                    None => false,
                });

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) if Self::is_dangling(&e) => {
                        warn!("跳过无法解析的符号链接: {}", e);
                        continue;
                    }
                    Err(e) => return Err(std::io::Error::from(e).into()),
                };
                let Some(relative) = Self::relative_path(&root, entry.path()) else {
                    continue;
                };

                if entry.file_type().is_dir() {
                    debug!("扫描 {}", entry.path().display());
                    snapshot.record_directory(&relative);
                } else if entry.file_type().is_file() {
                    let metadata = entry.metadata().map_err(std::io::Error::from)?;
                    let modified = from_system_time(metadata.modified()?);
                    snapshot.record_file(&FileEntry::new(relative, metadata.len(), modified));
                }
            }

            Ok(snapshot)
        })
        .await
        .map_err(|e| FileSpaceError::Io(std::io::Error::other(e)))?
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Readable for LocalFileSpace {
    async fn read_file(&self, path: &str) -> Result<ByteStream> {
        let file = fs::File::open(self.resolve_path(path)).await?;
        Ok(Box::pin(ReaderStream::new(file)))
    }
}

#[async_trait]
impl Writeable for LocalFileSpace {
    async fn create_directory(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve_path(path)).await?;
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> Result<()> {
        // 此时目录应已为空
        fs::remove_dir(self.resolve_path(path)).await?;
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, stream: Option<ByteStream>, entry: &FileEntry) -> Result<()> {
        let mut stream =
            stream.ok_or_else(|| FileSpaceError::MissingStream(entry.relative_path.clone()))?;
        let full_path = self.resolve_path(&entry.relative_path);
        let temp_path = Self::temp_path(&full_path);

        // 所有校验都在临时文件上完成，通过后才替换旧文件
        if let Err(e) = Self::write_temp(&mut stream, &temp_path, entry).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }

    fn supports_move(&self) -> bool {
        true
    }

    async fn move_file(&self, old_path: &str, new_path: &str) -> Result<()> {
        fs::rename(self.resolve_path(old_path), self.resolve_path(new_path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::compile_filters;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    fn touch(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
    }

    fn stream_of(data: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[test]
    fn test_open_requires_raw_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        assert!(LocalFileSpace::open(missing.to_str().unwrap(), None, vec![]).is_err());

        let space = LocalFileSpace::open(dir.path().to_str().unwrap(), Some("docs"), vec![]).unwrap();
        assert!(space.root().is_dir());
        assert!(space.root().ends_with("docs"));
    }

    #[tokio::test]
    async fn test_scan_applies_rules() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "a.txt", b"hello");
        touch(root, "notes.bak", b"x");
        touch(root, "build/out.o", b"obj");
        touch(root, "src/cache/blob", b"123");
        touch(root, "src/cache.txt", b"keep");
        touch(root, "src/main.rs", b"fn main() {}");
        touch(root, ".git/config", b"secret");

        let space =
            LocalFileSpace::open(root.to_str().unwrap(), None, vec!["build".to_string()]).unwrap();
        let filters = compile_filters(&[r"\.bak$".to_string(), "cache/".to_string()]).unwrap();
        let snapshot = space.scan(&filters).await.unwrap();

        let files: Vec<&str> = snapshot.files().keys().map(|s| s.as_str()).collect();
        assert_eq!(files, vec!["a.txt", "src/cache.txt", "src/main.rs"]);

        let dirs: Vec<&str> = snapshot.directories().iter().map(|s| s.as_str()).collect();
        assert_eq!(dirs, vec!["", "src"]);

        let entry = snapshot.file("a.txt").unwrap();
        assert_eq!(entry.file_size, 5);
        assert_eq!(entry.modified, Utc.timestamp_opt(1_600_000_000, 0).unwrap());
    }

    #[tokio::test]
    async fn test_write_sets_mtime_and_checks_size() {
        let dir = tempfile::tempdir().unwrap();
        let space = LocalFileSpace::open(dir.path().to_str().unwrap(), None, vec![]).unwrap();
        let time = Utc.timestamp_opt(1_500_000_000, 0).unwrap();

        let entry = FileEntry::new("ok.txt", 5, time);
        space.write_file(Some(stream_of(b"hello")), &entry).await.unwrap();

        let snapshot = space.scan(&[]).await.unwrap();
        let written = snapshot.file("ok.txt").unwrap();
        assert!(written.same_content(&entry));

        // 大小不符
        let short = FileEntry::new("short.txt", 10, time);
        let err = space.write_file(Some(stream_of(b"abc")), &short).await.unwrap_err();
        assert!(matches!(err, FileSpaceError::SizeMismatch { written: 3, .. }));

        // 没有数据流
        let err = space.write_file(None, &entry).await.unwrap_err();
        assert!(matches!(err, FileSpaceError::MissingStream(_)));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "doc.txt", b"GOOD OLD VERSION");
        let space = LocalFileSpace::open(dir.path().to_str().unwrap(), None, vec![]).unwrap();
        let time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let temp = dir.path().join(".doc.txt.svsync-tmp");

        // 数据流短于声明大小
        let entry = FileEntry::new("doc.txt", 100, time);
        let err = space.write_file(Some(stream_of(b"abc")), &entry).await.unwrap_err();
        assert!(matches!(err, FileSpaceError::SizeMismatch { written: 3, .. }));
        assert_eq!(std::fs::read(dir.path().join("doc.txt")).unwrap(), b"GOOD OLD VERSION");
        assert!(!temp.exists());

        // 数据流中途出错
        let broken: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ]));
        let entry = FileEntry::new("doc.txt", 7, time);
        let err = space.write_file(Some(broken), &entry).await.unwrap_err();
        assert!(matches!(err, FileSpaceError::Io(_)));
        assert_eq!(std::fs::read(dir.path().join("doc.txt")).unwrap(), b"GOOD OLD VERSION");
        assert!(!temp.exists());

        let snapshot = space.scan(&[]).await.unwrap();
        let kept = snapshot.file("doc.txt").unwrap();
        assert_eq!(kept.modified, Utc.timestamp_opt(1_600_000_000, 0).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_follows_symlinks() {
        use std::os::unix::fs::symlink;

        let outside = tempfile::tempdir().unwrap();
        touch(outside.path(), "shared/lib.txt", b"shared");
        touch(outside.path(), "single.txt", b"one");

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "a.txt", b"hello");
        symlink(outside.path().join("shared"), root.join("linked")).unwrap();
        symlink(outside.path().join("single.txt"), root.join("single.txt")).unwrap();
        symlink(root.join("missing.txt"), root.join("broken.txt")).unwrap();
        std::fs::create_dir(root.join("loop")).unwrap();
        symlink(root.join("loop"), root.join("loop/again")).unwrap();

        let space = LocalFileSpace::open(root.to_str().unwrap(), None, vec![]).unwrap();
        let snapshot = space.scan(&[]).await.unwrap();

        let files: Vec<&str> = snapshot.files().keys().map(|s| s.as_str()).collect();
        assert_eq!(files, vec!["a.txt", "linked/lib.txt", "single.txt"]);
        assert_eq!(snapshot.file("single.txt").unwrap().file_size, 3);

        let dirs: Vec<&str> = snapshot.directories().iter().map(|s| s.as_str()).collect();
        assert_eq!(dirs, vec!["", "linked", "loop"]);
    }

    #[tokio::test]
    async fn test_read_and_mutations() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a/x.txt", b"data");
        let space = LocalFileSpace::open(dir.path().to_str().unwrap(), None, vec![]).unwrap();

        let mut stream = space.read_file("a/x.txt").await.unwrap();
        let mut content = Vec::new();
        while let Some(chunk) = stream.next().await {
            content.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(content, b"data");

        space.create_directory("b").await.unwrap();
        space.move_file("a/x.txt", "b/x.txt").await.unwrap();
        space.delete_directory("a").await.unwrap();
        assert!(dir.path().join("b/x.txt").exists());
        assert!(!dir.path().join("a").exists());

        space.delete_file("b/x.txt").await.unwrap();
        // 删除不存在的文件不报错
        space.delete_file("b/x.txt").await.unwrap();
    }
}
