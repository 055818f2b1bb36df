//! 重连退避：第 n 次尝试延迟为 `first × factor^n`，上限 `max`
//!
//! 基础延迟只由尝试次数推导，不依赖上一次的结果，因此序列单调不减且有界。

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// 第一次重试前的延迟
    pub first: Duration,
    /// 延迟上限
    pub max: Duration,
    /// 增长因子（>= 1.0）
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(10),
            max: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// 第 attempt 次（从 0 开始）失败后的等待时长
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_with_ceiling() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(1),
            max: Duration::from_secs(4),
            factor: 2.0,
        };
        let seq: Vec<u64> = (0..6).map(|n| policy.next(n).as_secs()).collect();
        assert_eq!(seq, vec![1, 2, 4, 4, 4, 4]);
    }

    #[test]
    fn test_non_decreasing_and_bounded() {
        let policy = BackoffPolicy {
            first: Duration::from_millis(300),
            max: Duration::from_secs(60),
            factor: 1.7,
        };
        let mut prev = Duration::ZERO;
        for n in 0..200 {
            let d = policy.next(n);
            assert!(d >= prev, "attempt {} decreased", n);
            assert!(d <= policy.max);
            prev = d;
        }
    }

    #[test]
    fn test_first_exceeds_max() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(10),
            max: Duration::from_secs(5),
            factor: 2.0,
        };
        assert_eq!(policy.next(0), Duration::from_secs(5));
    }
}
