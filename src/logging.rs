//! 日志模块 - 控制台输出和带大小限制的文件日志

use crate::config::LogConfig;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "svsync.log";

type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

/// 将配置的日志级别转换为 tracing Level
pub fn tracing_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// 日志目录：未配置时使用系统数据目录
pub fn log_dir(config: &LogConfig) -> PathBuf {
    if let Some(dir) = &config.dir {
        return dir.clone();
    }
    directories::ProjectDirs::from("", "", "svsync")
        .map(|dirs| dirs.data_local_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".svsync").join("logs"))
}

/// 初始化日志系统
pub fn init(config: &LogConfig) {
    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = EnvFilter::from_default_env()
        .add_directive(tracing_level(&config.level).into())
        .add_directive(quiet("opendal=warn"))
        .add_directive(quiet("hyper=warn"))
        .add_directive(quiet("reqwest=warn"));

    let (subscriber, file_error) = build_subscriber(config, env_filter);
    let _ = tracing::subscriber::set_global_default(subscriber);
    if let Some(e) = file_error {
        // 文件日志创建失败，只输出到控制台
        tracing::warn!("无法创建日志文件: {}", e);
    }
}

/// 控制台层加上可选的文件层；文件无法打开时返回对应错误
fn build_subscriber(
    config: &LogConfig,
    env_filter: EnvFilter,
) -> (impl tracing::Subscriber + Send + Sync, Option<io::Error>) {
    let (file_layer, file_error) = match SizeRotatingWriter::new(&log_dir(config), config.max_size_mb)
    {
        Ok(file_writer) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false);
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    (subscriber, file_error)
}

fn quiet(directive: &str) -> tracing_subscriber::filter::Directive {
    directive
        .parse()
        .unwrap_or_else(|_| tracing::Level::WARN.into())
}

fn lock(writer: &SharedWriter) -> io::Result<MutexGuard<'_, Option<BufWriter<File>>>> {
    writer
        .lock()
        .map_err(|_| io::Error::other("log writer lock poisoned"))
}

/// 带大小限制的日志写入器，超过限制时轮转为 `svsync.log.old`
#[derive(Clone)]
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: SharedWriter,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE_NAME);
        let max_size = max_size_mb.max(1) * 1024 * 1024;
        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        // 现有文件超过限制则先轮转
        if Self::exceeds(file_path, max_size) {
            Self::rotate_log(file_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    fn exceeds(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path).is_ok_and(|m| m.len() > max_size)
    }

    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    /// 写入后检查大小，超过则关闭、轮转并重新打开
    fn rotate_if_needed(file_path: &Path, max_size: u64, writer: &SharedWriter) -> io::Result<()> {
        if !Self::exceeds(file_path, max_size) {
            return Ok(());
        }

        let mut guard = lock(writer)?;
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        Self::rotate_log(file_path)?;
        *guard = Some(Self::open_file(file_path, max_size)?);
        Ok(())
    }
}

/// 单次写入使用的句柄
pub struct LogWriter {
    inner: SharedWriter,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let mut guard = lock(&self.inner)?;
            match guard.as_mut() {
                Some(writer) => {
                    let n = writer.write(buf)?;
                    writer.flush()?;
                    n
                }
                None => return Err(io::Error::other("Writer not available")),
            }
        };

        let _ = SizeRotatingWriter::rotate_if_needed(&self.file_path, self.max_size, &self.inner);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner)?.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_level() {
        assert_eq!(tracing_level("DEBUG"), tracing::Level::DEBUG);
        assert_eq!(tracing_level("warn"), tracing::Level::WARN);
        assert_eq!(tracing_level("bogus"), tracing::Level::INFO);
    }

    #[test]
    fn test_rotates_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let line = vec![b'x'; 64 * 1024];

        for _ in 0..20 {
            writer.make_writer().write_all(&line).unwrap();
        }

        let backup = dir.path().join("svsync.log.old");
        assert!(backup.exists());
        assert!(fs::metadata(writer.file_path()).unwrap().len() <= 1024 * 1024);
    }

    #[test]
    fn test_existing_large_log_is_rotated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        fs::write(&path, vec![b'y'; 1024 * 1024 + 1]).unwrap();

        let writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        assert_eq!(fs::metadata(writer.file_path()).unwrap().len(), 0);
        assert!(dir.path().join("svsync.log.old").exists());
    }

    #[test]
    fn test_events_reach_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            dir: Some(dir.path().to_path_buf()),
            ..LogConfig::default()
        };

        let (subscriber, file_error) = build_subscriber(&config, EnvFilter::new("info"));
        assert!(file_error.is_none());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("同步开始");
            tracing::debug!("被过滤");
        });

        let content = fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert!(content.contains("同步开始"));
        assert!(!content.contains("被过滤"));
    }

    #[test]
    fn test_unwritable_log_dir_falls_back_to_console() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let config = LogConfig {
            dir: Some(blocker.join("logs")),
            ..LogConfig::default()
        };

        let (subscriber, file_error) = build_subscriber(&config, EnvFilter::new("info"));
        assert!(file_error.is_some());
        tracing::subscriber::with_default(subscriber, || tracing::info!("仍可输出"));
    }
}
