//! Cursor-paginated, rate-limited embedding backfill.
//!
//! One `embedding-batch` job handles one page of records that lack an
//! embedding. A full page re-enqueues a continuation carrying the advanced
//! cursor; a short or empty page ends the chain. Each execution is therefore
//! bounded by one page of provider calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use dailycast_core::{Clock, EmbeddingRecordType, UserId};
use dailycast_infra::jobs::{
    ELEVATED_PRIORITY, EnqueueOutcome, Job, JobError, JobHandler, JobId, JobOutcome, JobState,
    JobStore, QueueName, RetryPolicy,
};
use dailycast_infra::repository::{ContentRepository, MissingEmbeddingQuery};

use crate::capabilities::EmbeddingProvider;
use crate::stages::StageError;

/// Records fetched per job execution.
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Delay before a continuation page becomes claimable.
pub const CONTINUATION_DELAY: Duration = Duration::from_secs(2);

/// Upstream rate limit: texts per provider call and pause between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub batch_size: usize,
    pub delay: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            batch_size: 20,
            delay: Duration::from_secs(1),
        }
    }
}

/// Position of a backfill, carried in the job payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCursor {
    pub user_id: UserId,
    pub record_type: EmbeddingRecordType,
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_estimate: Option<u64>,
}

impl BatchCursor {
    fn job_id(&self) -> JobId {
        JobId::embedding(self.user_id, self.record_type, self.last_processed_id)
    }

    fn advanced_to(&self, last: Uuid) -> Self {
        Self {
            last_processed_id: Some(last),
            ..*self
        }
    }
}

/// Starts backfills.
pub struct EmbeddingBackfill {
    repository: Arc<dyn ContentRepository>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl EmbeddingBackfill {
    pub fn new(
        repository: Arc<dyn ContentRepository>,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        page_size: usize,
    ) -> Self {
        Self {
            repository,
            jobs,
            clock,
            page_size: page_size.max(1),
        }
    }

    /// Queue the first page for `user_id`. Returns `None` when nothing is missing.
    ///
    /// While any page of the same user and record type is waiting or active,
    /// no new chain starts; that page is reported as the duplicate.
    #[instrument(skip_all, fields(user_id = %user_id, record_type = %record_type), err)]
    pub async fn request(
        &self,
        user_id: UserId,
        record_type: EmbeddingRecordType,
    ) -> Result<Option<EnqueueOutcome>, StageError> {
        let total = self
            .repository
            .count_missing_embeddings(user_id, record_type)
            .await?;
        if total == 0 {
            debug!("no records missing embeddings");
            return Ok(None);
        }

        if let Some(live) = self.live_page(user_id, record_type).await? {
            debug!(job_id = %live.id, state = live.state.as_str(), "backfill already running");
            return Ok(Some(EnqueueOutcome::Duplicate {
                id: live.id,
                state: live.state,
            }));
        }

        let cursor = BatchCursor {
            user_id,
            record_type,
            batch_size: self.page_size,
            last_processed_id: None,
            total_estimate: Some(total),
        };
        let job = Job::with_payload(
            QueueName::EmbeddingBatch,
            cursor.job_id(),
            &cursor,
            self.clock.now(),
        )
        .map_err(|e| StageError::Integrity(e.to_string()))?
        .with_retry_policy(RetryPolicy::embedding_batch());

        let outcome = self.jobs.enqueue(job).await?;
        info!(total, duplicate = outcome.is_duplicate(), "embedding backfill requested");
        Ok(Some(outcome))
    }

    /// A waiting or active page of the chain for `user_id` and `record_type`.
    async fn live_page(
        &self,
        user_id: UserId,
        record_type: EmbeddingRecordType,
    ) -> Result<Option<Job>, StageError> {
        for state in [JobState::Active, JobState::Waiting] {
            let jobs = self
                .jobs
                .list(QueueName::EmbeddingBatch, Some(state), usize::MAX)
                .await?;
            let live = jobs.into_iter().find(|job| {
                job.payload_as::<BatchCursor>()
                    .is_ok_and(|c| c.user_id == user_id && c.record_type == record_type)
            });
            if live.is_some() {
                return Ok(live);
            }
        }
        Ok(None)
    }
}

/// Handler of `embedding-batch` jobs.
pub struct EmbeddingBatchHandler {
    repository: Arc<dyn ContentRepository>,
    provider: Arc<dyn EmbeddingProvider>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    rate_limit: RateLimit,
    call_timeout: Duration,
}

impl EmbeddingBatchHandler {
    pub fn new(
        repository: Arc<dyn ContentRepository>,
        provider: Arc<dyn EmbeddingProvider>,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            provider,
            jobs,
            clock,
            rate_limit: RateLimit::default(),
            call_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = RateLimit {
            batch_size: rate_limit.batch_size.max(1),
            ..rate_limit
        };
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Embed one page; returns the number of records processed and, for a
    /// full page, the cursor of the next page.
    async fn process_page(
        &self,
        cursor: &BatchCursor,
    ) -> Result<(usize, Option<BatchCursor>), StageError> {
        let page = self
            .repository
            .find_missing_embeddings(MissingEmbeddingQuery {
                user_id: cursor.user_id,
                record_type: cursor.record_type,
                after: cursor.last_processed_id,
                limit: cursor.batch_size,
            })
            .await?;

        for (i, chunk) in page.chunks(self.rate_limit.batch_size).enumerate() {
            if i > 0 && !self.rate_limit.delay.is_zero() {
                tokio::time::sleep(self.rate_limit.delay).await;
            }

            let texts: Vec<String> = chunk.iter().map(|c| c.text.clone()).collect();
            let vectors = match tokio::time::timeout(self.call_timeout, self.provider.embed(&texts)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(StageError::Timeout {
                        stage: "embedding",
                        after: self.call_timeout,
                    });
                }
            };
            if vectors.len() != chunk.len() {
                return Err(StageError::Integrity(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    chunk.len()
                )));
            }

            for (candidate, vector) in chunk.iter().zip(vectors) {
                self.repository
                    .save_embedding(cursor.record_type, candidate.id, vector)
                    .await?;
            }
        }

        let next = match page.last() {
            Some(last) if page.len() == cursor.batch_size => Some(cursor.advanced_to(last.id)),
            _ => None,
        };
        Ok((page.len(), next))
    }

    async fn enqueue_continuation(&self, next: &BatchCursor) -> Result<(), StageError> {
        let job = Job::with_payload(QueueName::EmbeddingBatch, next.job_id(), next, self.clock.now())
            .map_err(|e| StageError::Integrity(e.to_string()))?
            .with_retry_policy(RetryPolicy::embedding_batch())
            .with_priority(ELEVATED_PRIORITY)
            .delayed(CONTINUATION_DELAY);
        self.jobs.enqueue(job).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EmbeddingBatchHandler {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let cursor: BatchCursor = job.payload_as()?;

        let (processed, next) = self.process_page(&cursor).await?;
        info!(
            user_id = %cursor.user_id,
            record_type = %cursor.record_type,
            processed,
            total_estimate = ?cursor.total_estimate,
            continues = next.is_some(),
            "embedding page processed"
        );

        if let Some(next) = next {
            self.enqueue_continuation(&next).await?;
        }
        Ok(JobOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};
    use dailycast_core::{Article, ArticleId, ManualClock};
    use dailycast_infra::jobs::{InMemoryJobStore, JobState, QueueWorker};
    use dailycast_infra::repository::InMemoryContentRepository;

    use crate::capabilities::CapabilityResult;

    #[derive(Default)]
    struct RecordingProvider {
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingProvider for RecordingProvider {
        async fn embed(&self, texts: &[String]) -> CapabilityResult<Vec<Vec<f32>>> {
            self.calls.lock().unwrap().push(texts.len());
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Fixture {
        repo: Arc<InMemoryContentRepository>,
        jobs: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
        provider: Arc<RecordingProvider>,
        worker: QueueWorker<Arc<InMemoryJobStore>>,
        backfill: EmbeddingBackfill,
        user: UserId,
    }

    fn fixture(articles: usize) -> Fixture {
        let repo = InMemoryContentRepository::arc();
        let jobs = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(t0()));
        let provider = Arc::new(RecordingProvider::default());
        let user = UserId::new();

        for i in 0..articles {
            repo.insert_article(Article {
                id: ArticleId::new(),
                user_id: user,
                title: format!("article {i}"),
                body: "body".into(),
                url: None,
                ingested_at: t0(),
            });
        }

        let handler = EmbeddingBatchHandler::new(repo.clone(), provider.clone(), jobs.clone(), clock.clone())
            .with_rate_limit(RateLimit {
                batch_size: 20,
                delay: Duration::from_millis(1),
            });
        let mut worker = QueueWorker::new(jobs.clone(), clock.clone());
        worker.register_handler(QueueName::EmbeddingBatch, Arc::new(handler));

        let backfill = EmbeddingBackfill::new(repo.clone(), jobs.clone(), clock.clone(), 50);
        Fixture {
            repo,
            jobs,
            clock,
            provider,
            worker,
            backfill,
            user,
        }
    }

    #[tokio::test]
    async fn pages_until_short_page() {
        let f = fixture(120);
        f.backfill
            .request(f.user, EmbeddingRecordType::Article)
            .await
            .unwrap()
            .unwrap();

        let mut executions = 0;
        loop {
            let ran = f.worker.drain(QueueName::EmbeddingBatch).await.unwrap();
            if ran == 0 {
                let stats = f.jobs.stats(QueueName::EmbeddingBatch).await.unwrap();
                if stats.waiting == 0 {
                    break;
                }
                // Continuations are delayed.
                f.clock.advance(chrono::Duration::seconds(2));
                continue;
            }
            executions += ran;
        }

        assert_eq!(executions, 3);
        let completed = f
            .jobs
            .list(QueueName::EmbeddingBatch, Some(JobState::Completed), 10)
            .await
            .unwrap();
        assert_eq!(completed.len(), 3);
        assert_eq!(
            f.repo
                .count_missing_embeddings(f.user, EmbeddingRecordType::Article)
                .await
                .unwrap(),
            0
        );

        // Two full pages of 20+20+10, then 20.
        assert_eq!(*f.provider.calls.lock().unwrap(), vec![20, 20, 10, 20, 20, 10, 20]);
    }

    #[tokio::test]
    async fn continuation_is_delayed_and_elevated() {
        let f = fixture(50);
        f.backfill
            .request(f.user, EmbeddingRecordType::Article)
            .await
            .unwrap();
        assert_eq!(f.worker.drain(QueueName::EmbeddingBatch).await.unwrap(), 1);

        let waiting = f
            .jobs
            .list(QueueName::EmbeddingBatch, Some(JobState::Waiting), 10)
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        let next = &waiting[0];
        assert_eq!(next.priority, ELEVATED_PRIORITY);
        assert_eq!(next.run_at, t0() + chrono::Duration::seconds(2));
        let cursor: BatchCursor = next.payload_as().unwrap();
        assert!(cursor.last_processed_id.is_some());
        assert_eq!(cursor.total_estimate, Some(50));

        // The follow-up page is empty and ends the chain.
        f.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(f.worker.drain(QueueName::EmbeddingBatch).await.unwrap(), 1);
        assert_eq!(f.jobs.stats(QueueName::EmbeddingBatch).await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn nothing_missing_requests_nothing() {
        let f = fixture(0);
        assert!(f
            .backfill
            .request(f.user, EmbeddingRecordType::Summary)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn repeated_request_is_deduplicated() {
        let f = fixture(10);
        let first = f.backfill.request(f.user, EmbeddingRecordType::Article).await.unwrap().unwrap();
        let second = f.backfill.request(f.user, EmbeddingRecordType::Article).await.unwrap().unwrap();
        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
    }

    #[tokio::test]
    async fn request_during_running_chain_starts_nothing() {
        let f = fixture(120);
        f.backfill.request(f.user, EmbeddingRecordType::Article).await.unwrap();
        assert_eq!(f.worker.drain(QueueName::EmbeddingBatch).await.unwrap(), 1);

        // Page 0 is done and its continuation is waiting.
        let again = f
            .backfill
            .request(f.user, EmbeddingRecordType::Article)
            .await
            .unwrap()
            .unwrap();
        assert!(again.is_duplicate());
        assert!(!again.id().as_str().ends_with(":start"));
        assert_eq!(f.jobs.stats(QueueName::EmbeddingBatch).await.unwrap().waiting, 1);

        // Another user's backfill is independent.
        let other = UserId::new();
        f.repo.insert_article(Article {
            id: ArticleId::new(),
            user_id: other,
            title: "other".into(),
            body: "body".into(),
            url: None,
            ingested_at: t0(),
        });
        let started = f.backfill.request(other, EmbeddingRecordType::Article).await.unwrap().unwrap();
        assert!(!started.is_duplicate());

        for _ in 0..5 {
            f.clock.advance(chrono::Duration::seconds(2));
            f.worker.drain(QueueName::EmbeddingBatch).await.unwrap();
        }
        assert_eq!(
            f.repo
                .count_missing_embeddings(f.user, EmbeddingRecordType::Article)
                .await
                .unwrap(),
            0
        );
        // One chain of three pages plus the other user's single page.
        assert_eq!(*f.provider.calls.lock().unwrap(), vec![20, 20, 10, 20, 20, 10, 1, 20]);
    }

    #[test]
    fn cursor_payload_shape() {
        let cursor = BatchCursor {
            user_id: UserId::new(),
            record_type: EmbeddingRecordType::Summary,
            batch_size: 50,
            last_processed_id: None,
            total_estimate: Some(3),
        };
        let json = serde_json::to_value(cursor).unwrap();
        assert_eq!(json["recordType"], "summary");
        assert_eq!(json["batchSize"], 50);
        assert!(json.get("lastProcessedId").is_none());
    }
}
