use std::time::Duration;

const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

/// 可读的文件大小（1024 进制）
pub fn readable_file_size(size: u64) -> String {
    if size == 0 {
        return "0".to_string();
    }

    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let text = format!("{:.1}", value);
    let text = text.strip_suffix(".0").unwrap_or(&text);
    format!("{} {}", text, UNITS[unit])
}

/// 可读的传输速率（每秒）
pub fn readable_transfer_rate(size: u64, elapsed: Duration) -> String {
    let millis = elapsed.as_millis().max(1) as f64;
    let per_second = (size as f64 / millis * 1000.0).round() as u64;
    format!("{}/s", readable_file_size(per_second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_file_size() {
        assert_eq!(readable_file_size(0), "0");
        assert_eq!(readable_file_size(512), "512 B");
        assert_eq!(readable_file_size(1024), "1 kB");
        assert_eq!(readable_file_size(1536), "1.5 kB");
        assert_eq!(readable_file_size(5 * 1024 * 1024), "5 MB");
    }

    #[test]
    fn test_readable_transfer_rate() {
        assert_eq!(
            readable_transfer_rate(2 * 1024 * 1024, Duration::from_secs(2)),
            "1 MB/s"
        );
        // 耗时为 0 时按 1ms 计
        assert_eq!(readable_transfer_rate(1, Duration::ZERO), "1000 B/s");
    }
}
