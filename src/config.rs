//! 同步配置（JSON profile）

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// S3 凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Azure Blob 凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureCredentials {
    pub account_name: String,
    pub account_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// SMB 凭据
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmbCredentials {
    #[serde(default)]
    pub domain: Option<String>,
    pub user: String,
    pub password: String,
}

/// 各后端凭据，按路径前缀选用其一
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub s3: Option<S3Credentials>,
    #[serde(default)]
    pub azure: Option<AzureCredentials>,
    #[serde(default)]
    pub smb: Option<SmbCredentials>,
}

/// 源端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    /// 缓存有效天数，为空表示不缓存
    #[serde(default)]
    pub cache_days: Option<u32>,
    #[serde(flatten)]
    pub credentials: Credentials,
}

impl SourceConfig {
    /// 排除路径规范化为相对根目录、以 `/` 分隔的前缀
    ///
    /// 绝对路径（位于根目录下）会去掉根目录部分；其它路径按相对路径处理。
    pub fn normalized_excludes(&self) -> Vec<String> {
        let root = normalize_separators(&self.path);
        let root = root.trim_end_matches('/');

        self.excludes
            .iter()
            .map(|exclude| {
                let exclude = normalize_separators(exclude);
                let relative = match exclude.strip_prefix(root) {
                    Some(rest) if !root.is_empty() && (rest.is_empty() || rest.starts_with('/')) => {
                        rest
                    }
                    _ => exclude.as_str(),
                };
                relative.trim_matches('/').to_string()
            })
            .filter(|exclude| !exclude.is_empty())
            .collect()
    }
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// 目标端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub path: String,
    #[serde(default)]
    pub cache_days: Option<u32>,
    #[serde(flatten)]
    pub credentials: Credentials,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_level")]
    pub level: String,
    /// 单个日志文件最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    /// 日志目录，为空时使用系统数据目录
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

fn default_max_size_mb() -> u64 {
    5
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_level(),
            max_size_mb: default_max_size_mb(),
            dir: None,
        }
    }
}

/// 完整的同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    pub sources: Vec<SourceConfig>,
    pub target: TargetConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl ProfileConfig {
    /// 从文件加载并校验
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
        let config: ProfileConfig = serde_json::from_str(&content)
            .with_context(|| format!("配置文件格式错误: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("至少需要配置一个源");
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                bail!("源名称不能为空: {}", source.path);
            }
            if source.name.contains(['/', '\\']) {
                bail!("源名称不能包含路径分隔符: {}", source.name);
            }
            if !names.insert(source.name.as_str()) {
                bail!("源名称重复: {}", source.name);
            }
            if source.path.trim().is_empty() {
                bail!("源路径不能为空: {}", source.name);
            }
        }

        if self.target.path.trim().is_empty() {
            bail!("目标路径不能为空");
        }

        Ok(())
    }

    /// 缓存目录，未配置时使用系统缓存目录
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "svsync")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("svsync"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"{
        "sources": [
            { "name": "docs", "path": "/home/me/docs",
              "excludes": ["/home/me/docs/tmp/", "build"], "filters": ["\\.bak$"],
              "cacheDays": 3 },
            { "name": "photos", "path": "s3://media/photos",
              "s3": { "accessKey": "ak", "secretKey": "sk" } }
        ],
        "target": { "path": "/mnt/backup", "cacheDays": 7 },
        "log": { "level": "debug" }
    }"#;

    fn write_profile(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_profile() {
        let (_dir, path) = write_profile(PROFILE);
        let config = ProfileConfig::load(&path).unwrap();

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].cache_days, Some(3));
        assert_eq!(config.sources[1].cache_days, None);

        let s3 = config.sources[1].credentials.s3.as_ref().unwrap();
        assert_eq!(s3.access_key, "ak");
        assert_eq!(s3.region, "us-east-1");

        assert_eq!(config.target.cache_days, Some(7));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.max_size_mb, 5);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_normalized_excludes() {
        let (_dir, path) = write_profile(PROFILE);
        let config = ProfileConfig::load(&path).unwrap();

        assert_eq!(config.sources[0].normalized_excludes(), vec!["tmp", "build"]);
    }

    #[test]
    fn test_windows_excludes() {
        let source = SourceConfig {
            name: "w".to_string(),
            path: "C:\\Data\\".to_string(),
            excludes: vec!["C:\\Data\\cache".to_string(), "C:\\Database".to_string()],
            filters: vec![],
            cache_days: None,
            credentials: Credentials::default(),
        };

        // C:/Database 不在根目录下，按相对路径处理
        assert_eq!(source.normalized_excludes(), vec!["cache", "C:/Database"]);
    }

    #[test]
    fn test_rejects_invalid_profiles() {
        let (_dir, path) = write_profile(r#"{ "sources": [], "target": { "path": "/x" } }"#);
        assert!(ProfileConfig::load(&path).is_err());

        let (_dir, path) = write_profile(
            r#"{ "sources": [{ "name": "a", "path": "/a" }, { "name": "a", "path": "/b" }],
                 "target": { "path": "/x" } }"#,
        );
        assert!(ProfileConfig::load(&path).is_err());

        let (_dir, path) = write_profile("not json");
        assert!(ProfileConfig::load(&path).is_err());

        assert!(ProfileConfig::load(Path::new("/definitely/missing.json")).is_err());
    }
}
