//! 远程调用重试

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// 带指数退避的重试，最多尝试 `max_attempts` 次
pub async fn with_retry<T, E, F, Fut>(
    what: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                let delay = base_delay * 2_u32.pow(attempt - 1);
                warn!(
                    "{} 失败，{}ms 后重试 ({}/{}): {}",
                    what,
                    delay.as_millis(),
                    attempt,
                    max_attempts,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!("{} 最终失败 (共尝试{}次): {}", what, attempt, e);
                return Err(e);
            }
        }
    }
}
