use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobqueue_core::{
    models::{to_millis, EventKind, JobLock, JobRecord, JobState, NewEvent},
    QueueError, QueueResult,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::JobLifecycle;
use crate::rate_limiter::{LimiterDecision, RateLimiter};

/// 一次领取尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// 领取成功，记录中带有新的锁令牌
    Claimed(JobRecord),
    /// 没有可领取的任务
    Empty,
    /// 队列已暂停
    Paused,
    /// 限流窗口内的令牌已耗尽，在 `until` 之前不应再尝试
    RateLimited { until: DateTime<Utc> },
}

/// 索引中残留的失效成员最多清理次数
const MAX_STALE_SKIPS: usize = 16;

enum ClaimStep {
    Done(ClaimOutcome),
    /// 索引指向的任务记录已不存在，已清理，继续领取下一个
    SkippedStale(String),
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(duration.as_millis() as i64)
}

impl JobLifecycle {
    /// 原子地领取优先级最高的等待任务
    pub async fn claim(&self, worker_id: &str, lock_duration: Duration) -> QueueResult<ClaimOutcome> {
        for _ in 0..MAX_STALE_SKIPS {
            match self
                .atomically("claim", || self.try_claim(worker_id, lock_duration))
                .await?
            {
                ClaimStep::Done(outcome) => return Ok(outcome),
                ClaimStep::SkippedStale(id) => {
                    warn!("等待队列中的任务 {} 没有记录，已从索引移除", id);
                }
            }
        }
        Ok(ClaimOutcome::Empty)
    }

    async fn try_claim(
        &self,
        worker_id: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<ClaimStep>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();

        if self.is_paused_in(tx.as_mut()).await? {
            return Self::commit(tx, ClaimStep::Done(ClaimOutcome::Paused)).await;
        }

        let wait_key = self.keys.wait();
        let Some((job_id, _)) = tx.zrange(&wait_key, 0, 0).await?.into_iter().next() else {
            return Self::commit(tx, ClaimStep::Done(ClaimOutcome::Empty)).await;
        };

        let limiter_update = match &self.options.limiter {
            Some(limiter) => {
                let limiter_key = self.keys.limiter();
                let state = RateLimiter::load(tx.as_mut(), &limiter_key).await?;
                match RateLimiter::consume(state, limiter, to_millis(now)) {
                    LimiterDecision::Allowed(next) => Some((limiter_key, next)),
                    LimiterDecision::Throttled { reset_at_ms } => {
                        let until = Self::time_from_millis(reset_at_ms)?;
                        return Self::commit(
                            tx,
                            ClaimStep::Done(ClaimOutcome::RateLimited { until }),
                        )
                        .await;
                    }
                }
            }
            None => None,
        };

        let Some(mut record) = self.load_job(tx.as_mut(), &job_id).await? else {
            tx.zrem(&wait_key, &job_id);
            return Self::commit(tx, ClaimStep::SkippedStale(job_id)).await;
        };

        let expires_at = now + chrono_duration(lock_duration);
        record.state = JobState::Active;
        record.processed_at = Some(now);
        record.lock = Some(JobLock {
            token: Uuid::new_v4().to_string(),
            worker_id: worker_id.to_string(),
            expires_at,
        });

        tx.zrem(&wait_key, &record.id);
        tx.zadd(&self.keys.active(), &record.id, to_millis(expires_at) as f64);
        if let Some((limiter_key, next)) = limiter_update {
            tx.hset(&limiter_key, RateLimiter::to_fields(&next));
        }
        self.save_record(tx.as_mut(), &record)?;
        self.emit(
            tx.as_mut(),
            NewEvent::job(EventKind::Active, &record.id).with_data(JobState::Waiting.as_str()),
            now,
        );

        let claimed = ClaimStep::Done(ClaimOutcome::Claimed(record));
        let result = Self::commit(tx, claimed).await?;
        if let Some(ClaimStep::Done(ClaimOutcome::Claimed(record))) = &result {
            debug!("Worker {} 领取了任务 {}", worker_id, record.id);
        }
        Ok(result)
    }

    /// 续期锁；令牌不匹配或租约已过期时返回 `LockLost`
    pub async fn renew_lock(
        &self,
        job_id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        self.atomically("renew_lock", || self.try_renew_lock(job_id, token, lock_duration))
            .await
    }

    async fn try_renew_lock(
        &self,
        job_id: &str,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<DateTime<Utc>>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();

        let mut record = self.owned_job(tx.as_mut(), job_id, token, now).await?;
        let expires_at = now + chrono_duration(lock_duration);
        if let Some(lock) = record.lock.as_mut() {
            lock.expires_at = expires_at;
        }
        tx.zadd(&self.keys.active(), job_id, to_millis(expires_at) as f64);
        self.save_record(tx.as_mut(), &record)?;
        Self::commit(tx, expires_at).await
    }

    /// 读取并校验由 `token` 持有且在 `now` 时仍有效的活跃任务
    pub(super) async fn owned_job(
        &self,
        tx: &mut dyn jobqueue_core::StoreTx,
        job_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<JobRecord> {
        match self.load_job(tx, job_id).await? {
            Some(record) if record.is_locked_by(token, now) => Ok(record),
            _ => Err(QueueError::LockLost {
                job_id: job_id.to_string(),
            }),
        }
    }

    pub(super) fn time_from_millis(ms: i64) -> QueueResult<DateTime<Utc>> {
        jobqueue_core::models::from_millis(ms)
    }
}
