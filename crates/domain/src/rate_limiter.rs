//! 队列级令牌桶限流
//!
//! 令牌在每次领取时按窗口惰性补充，不需要后台定时器；状态只在领取所在的原子单元中读写。

use jobqueue_core::{
    models::{LimiterState, RateLimiterOptions},
    QueueResult, StoreTx,
};

const FIELD_TOKENS: &str = "tokens";
const FIELD_RESET_AT: &str = "resetAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterDecision {
    /// 允许激活，携带扣减后的状态
    Allowed(LimiterState),
    /// 令牌耗尽，窗口在 `reset_at_ms` 重置
    Throttled { reset_at_ms: i64 },
}

pub struct RateLimiter;

impl RateLimiter {
    pub async fn load(tx: &mut dyn StoreTx, key: &str) -> QueueResult<Option<LimiterState>> {
        let raw = tx.hgetall(key).await?;
        let tokens = raw.get(FIELD_TOKENS).and_then(|v| v.parse().ok());
        let reset_at_ms = raw.get(FIELD_RESET_AT).and_then(|v| v.parse().ok());
        Ok(match (tokens, reset_at_ms) {
            (Some(tokens), Some(reset_at_ms)) => Some(LimiterState {
                tokens,
                reset_at_ms,
            }),
            _ => None,
        })
    }

    /// 尝试消耗一个令牌
    pub fn consume(
        state: Option<LimiterState>,
        options: &RateLimiterOptions,
        now_ms: i64,
    ) -> LimiterDecision {
        let state = match state {
            Some(state) if now_ms < state.reset_at_ms => state,
            _ => LimiterState {
                tokens: options.max,
                reset_at_ms: now_ms + options.duration_ms as i64,
            },
        };
        if state.tokens == 0 {
            return LimiterDecision::Throttled {
                reset_at_ms: state.reset_at_ms,
            };
        }
        LimiterDecision::Allowed(LimiterState {
            tokens: state.tokens - 1,
            reset_at_ms: state.reset_at_ms,
        })
    }

    pub fn to_fields(state: &LimiterState) -> Vec<(String, String)> {
        vec![
            (FIELD_TOKENS.to_string(), state.tokens.to_string()),
            (FIELD_RESET_AT.to_string(), state.reset_at_ms.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_allows_max_then_throttles() {
        let options = RateLimiterOptions::new(2, 1_000);
        let mut state = None;
        for _ in 0..2 {
            match RateLimiter::consume(state, &options, 10) {
                LimiterDecision::Allowed(next) => state = Some(next),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            RateLimiter::consume(state, &options, 500),
            LimiterDecision::Throttled { reset_at_ms: 1_010 }
        );
    }

    #[test]
    fn test_window_resets_lazily() {
        let options = RateLimiterOptions::new(1, 1_000);
        let exhausted = Some(LimiterState {
            tokens: 0,
            reset_at_ms: 1_000,
        });
        assert_eq!(
            RateLimiter::consume(exhausted, &options, 5_000),
            LimiterDecision::Allowed(LimiterState {
                tokens: 0,
                reset_at_ms: 6_000
            })
        );
    }
}
