//! 冷却/退避重试策略。

use std::time::Duration;

use tracing::debug;

const INITIAL_DELAY: Duration = Duration::from_millis(1100);
const MAX_DELAY: Duration = Duration::from_secs(8);

/// 单次尝试的结局：可重试的错误会在退避后再来一次，其它错误立即返回。
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
    Fatal(E),
}

/// 第 `attempt`（从 0 开始）次失败后的等待时间：1.1s 起步，逐次翻倍，封顶 8s。
pub fn backoff_delay(attempt: usize) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
    INITIAL_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

/// 最多尝试 `max_attempts` 次（至少 1 次），返回最后一次的错误。
pub fn retry_with_backoff<T, E, F>(max_attempts: usize, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Attempt<T, E>,
{
    retry_with_sleeper(max_attempts, &mut op, std::thread::sleep)
}

fn retry_with_sleeper<T, E, F, S>(max_attempts: usize, op: &mut F, mut sleep: S) -> Result<T, E>
where
    F: FnMut(usize) -> Attempt<T, E>,
    S: FnMut(Duration),
{
    let attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Attempt::Done(v) => return Ok(v),
            Attempt::Fatal(e) => return Err(e),
            Attempt::Retry(e) => {
                if attempt + 1 >= attempts {
                    return Err(e);
                }
                let delay = backoff_delay(attempt);
                debug!(
                    target: "network",
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "请求失败，退避后重试"
                );
                sleep(delay);
                attempt += 1;
            }
        }
    }
}
