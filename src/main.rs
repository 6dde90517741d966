use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use svsync_lib::config::ProfileConfig;
use svsync_lib::core::{analyze_profile, restore_profile, sync_profile};
use tracing::info;

/// svsync - 将多个源目录镜像到同一个目标存储
#[derive(Parser)]
#[command(name = "svsync")]
#[command(version)]
struct Cli {
    /// 配置文件（JSON）
    #[arg(long)]
    profile: PathBuf,

    /// 只分析差异，不做任何修改
    #[arg(long, conflicts_with = "restore")]
    analyze: bool,

    /// 把目标端内容恢复到该本地路径
    #[arg(long, value_name = "PATH")]
    restore: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let profile = match ProfileConfig::load(&cli.profile) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("无法加载配置: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    svsync_lib::logging::init(&profile.log);

    if cli.analyze {
        let (results, total) = analyze_profile(&profile).await;
        for (name, diff) in &results {
            println!("===== {} =====", name);
            print!("{}", diff);
            println!("{}", diff.stat);
        }
        println!("===== 合计 =====");
        println!("{}", total);
    } else if let Some(path) = &cli.restore {
        let report = restore_profile(&profile, path).await;
        info!("恢复完成: {}", report);
    } else {
        let report = sync_profile(&profile).await;
        info!("全部同步完成: {}", report);
    }

    ExitCode::SUCCESS
}
