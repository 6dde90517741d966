pub mod local;
pub mod object;
pub mod retry;

use crate::config::{SourceConfig, TargetConfig};
use crate::core::snapshot::{FileEntry, Snapshot};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use regex::Regex;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

pub use local::LocalFileSpace;
pub use object::ObjectFileSpace;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 远程列表/元数据调用的最大尝试次数
pub const MAX_ATTEMPTS: u32 = 3;

/// 存储层错误
#[derive(Debug, Error)]
pub enum FileSpaceError {
    #[error("初始化失败: {0}")]
    Init(String),
    #[error("不支持: {0}")]
    Unsupported(String),
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("存储错误: {0}")]
    Storage(#[from] opendal::Error),
    #[error("过滤规则无效: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("没有可写入的数据流: {0}")]
    MissingStream(String),
    #[error("写入字节数不符: {path} (期望 {expected}, 实际 {written})")]
    SizeMismatch {
        path: String,
        expected: u64,
        written: u64,
    },
    #[error("修改时间未能保存: {0}")]
    TimestampMismatch(String),
    #[error("文件不存在: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, FileSpaceError>;

/// 文件字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// 可扫描
#[async_trait]
pub trait Scannable: Send + Sync {
    /// 扫描整个根目录，filters 为 "包含即排除" 的正则
    async fn scan(&self, filters: &[Regex]) -> Result<Snapshot>;

    /// 存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 可读取（源端）
#[async_trait]
pub trait Readable: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<ByteStream>;
}

/// 可写入（目标端）
#[async_trait]
pub trait Writeable: Send + Sync {
    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn delete_directory(&self, path: &str) -> Result<()>;

    async fn delete_file(&self, path: &str) -> Result<()>;

    /// 写入文件并设置修改时间
    ///
    /// 写入字节数必须等于 `entry.file_size`，且存储端的修改时间必须等于
    /// `entry.modified`，否则即使没有传输错误也算失败。
    async fn write_file(&self, stream: Option<ByteStream>, entry: &FileEntry) -> Result<()>;

    fn supports_move(&self) -> bool;

    async fn move_file(&self, old_path: &str, new_path: &str) -> Result<()>;
}

/// 源端：可扫描 + 可读取
pub trait SourceSpace: Scannable + Readable {}
impl<T: Scannable + Readable> SourceSpace for T {}

/// 目标端：可扫描 + 可写入
pub trait TargetSpace: Scannable + Writeable {}
impl<T: Scannable + Writeable> TargetSpace for T {}

/// 编译过滤规则
pub fn compile_filters(filters: &[String]) -> Result<Vec<Regex>> {
    filters
        .iter()
        .map(|f| Regex::new(f).map_err(FileSpaceError::from))
        .collect()
}

/// 扫描时的排除规则
///
/// excludes 为相对根目录、以 `/` 分隔的路径前缀（字面前缀匹配，目录命中时整棵子树跳过）；
/// filters 为正则，目录匹配时会在末尾加 `/`。以 `.` 开头的隐藏项总是跳过。
#[derive(Debug, Clone, Default)]
pub struct ScanRules {
    excludes: Vec<String>,
}

impl ScanRules {
    pub fn new(excludes: Vec<String>) -> Self {
        Self { excludes }
    }

    pub fn is_excluded(&self, relative_path: &str) -> bool {
        self.excludes
            .iter()
            .any(|exclude| relative_path.starts_with(exclude.as_str()))
    }

    pub fn is_filtered(relative_path: &str, is_dir: bool, filters: &[Regex]) -> bool {
        if is_dir {
            let with_slash = format!("{}/", relative_path);
            filters.iter().any(|f| f.is_match(&with_slash))
        } else {
            filters.iter().any(|f| f.is_match(relative_path))
        }
    }

    pub fn is_hidden(relative_path: &str) -> bool {
        relative_path.split('/').any(|segment| segment.starts_with('.'))
    }

    /// 综合判断
    pub fn should_skip(&self, relative_path: &str, is_dir: bool, filters: &[Regex]) -> bool {
        Self::is_hidden(relative_path)
            || self.is_excluded(relative_path)
            || Self::is_filtered(relative_path, is_dir, filters)
    }
}

// ============ 存储注册表 ============

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Smb,
    S3,
    Azure,
    Local,
}

/// 按优先级排列的 URI 前缀判断
const REGISTRY: [(BackendKind, fn(&str) -> bool); 4] = [
    (BackendKind::Smb, is_smb_path),
    (BackendKind::S3, is_s3_path),
    (BackendKind::Azure, is_azure_path),
    (BackendKind::Local, is_local_path),
];

fn has_scheme(path: &str, scheme: &str) -> bool {
    path.get(..scheme.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
}

fn is_smb_path(path: &str) -> bool {
    has_scheme(path, "smb://")
}

fn is_s3_path(path: &str) -> bool {
    has_scheme(path, "s3://")
}

fn is_azure_path(path: &str) -> bool {
    has_scheme(path, "azure://")
}

fn is_local_path(path: &str) -> bool {
    !path.is_empty() && !path.contains("://")
}

/// 根据路径选择后端类型
pub fn detect_backend(path: &str) -> Option<BackendKind> {
    REGISTRY
        .iter()
        .find(|(_, matches)| matches(path))
        .map(|(kind, _)| *kind)
}

/// 创建源端存储
pub async fn create_source(config: &SourceConfig) -> Result<Arc<dyn SourceSpace>> {
    let excludes = config.normalized_excludes();
    let path = config.path.as_str();

    match detect_backend(path) {
        Some(BackendKind::Local) => {
            tracing::info!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalFileSpace::open(path, None, excludes)?) as Arc<dyn SourceSpace>)
        }
        Some(BackendKind::S3) => {
            let creds = config
                .credentials
                .s3
                .as_ref()
                .ok_or_else(|| FileSpaceError::Init(format!("S3 存储缺少凭据: {}", path)))?;
            tracing::info!("初始化S3存储: {}", path);
            Ok(Arc::new(ObjectFileSpace::s3(path, None, creds, excludes).await?) as Arc<dyn SourceSpace>)
        }
        Some(BackendKind::Azure) => {
            let creds = config
                .credentials
                .azure
                .as_ref()
                .ok_or_else(|| FileSpaceError::Init(format!("Azure 存储缺少凭据: {}", path)))?;
            tracing::info!("初始化Azure存储: {}", path);
            Ok(
                Arc::new(ObjectFileSpace::azure(path, None, creds, excludes).await?)
                    as Arc<dyn SourceSpace>,
            )
        }
        Some(BackendKind::Smb) => Err(unsupported_smb(path)),
        None => Err(FileSpaceError::Init(format!("无法识别的路径: {}", path))),
    }
}

/// 创建目标端存储，落在 `<root>/<source_name>` 下
pub async fn create_target(
    config: &TargetConfig,
    source_name: &str,
) -> Result<Arc<dyn TargetSpace>> {
    let path = config.path.as_str();

    match detect_backend(path) {
        Some(BackendKind::Local) => {
            tracing::info!("初始化本地存储: {}/{}", path, source_name);
            Ok(
                Arc::new(LocalFileSpace::open(path, Some(source_name), Vec::new())?)
                    as Arc<dyn TargetSpace>,
            )
        }
        Some(BackendKind::S3) => {
            let creds = config
                .credentials
                .s3
                .as_ref()
                .ok_or_else(|| FileSpaceError::Init(format!("S3 存储缺少凭据: {}", path)))?;
            tracing::info!("初始化S3存储: {}/{}", path, source_name);
            Ok(
                Arc::new(ObjectFileSpace::s3(path, Some(source_name), creds, Vec::new()).await?)
                    as Arc<dyn TargetSpace>,
            )
        }
        Some(BackendKind::Azure) => {
            let creds = config
                .credentials
                .azure
                .as_ref()
                .ok_or_else(|| FileSpaceError::Init(format!("Azure 存储缺少凭据: {}", path)))?;
            tracing::info!("初始化Azure存储: {}/{}", path, source_name);
            Ok(Arc::new(
                ObjectFileSpace::azure(path, Some(source_name), creds, Vec::new()).await?,
            ) as Arc<dyn TargetSpace>)
        }
        Some(BackendKind::Smb) => Err(unsupported_smb(path)),
        None => Err(FileSpaceError::Init(format!("无法识别的路径: {}", path))),
    }
}

fn unsupported_smb(path: &str) -> FileSpaceError {
    FileSpaceError::Unsupported(format!("未编译 SMB 驱动，无法访问 {}", path))
}
