use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::database::{now_unix_seconds, Database};
use crate::db::models::{GenerationInsert, GenerationRow, GenerationStatus};
use crate::kie::{CallbackEvent, CallbackOutcome, GenerationRequest, ProviderError, VideoModel, VideoProvider};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("insufficient credits: balance {balance}, cost {cost}")]
    InsufficientCredits { balance: i64, cost: i64 },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    /// The job could not be started and its charge could not be returned.
    #[error("{cause}; refunding {cost} credits also failed: {refund_error}")]
    RefundFailed {
        cause: String,
        cost: i64,
        refund_error: String,
    },
}

#[derive(Debug, Clone)]
pub struct NewGeneration {
    pub user_id: i64,
    pub chat_id: i64,
    pub model: VideoModel,
    pub prompt: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGeneration {
    pub task_id: String,
    pub model: VideoModel,
    pub remaining_credits: i64,
}

/// What the HTTP layer should do after a provider callback was applied.
#[derive(Debug, Clone)]
pub enum CallbackResolution {
    /// This callback completed the job; the video must be delivered.
    Deliver { job: GenerationRow, video_url: String },
    /// This callback failed the job and its cost went back to the user.
    Refunded { job: GenerationRow, reason: Option<String> },
    StillPending { task_id: String },
    /// The job had already been settled by an earlier callback or the sweeper.
    Duplicate { task_id: String },
    Unknown { task_id: String },
}

/// Owns job state transitions. Every transition is a conditional update, so
/// concurrent or repeated callbacks settle a job (and refund it) at most once.
#[derive(Clone)]
pub struct GenerationTracker {
    db: Database,
}

impl GenerationTracker {
    pub fn new(db: Database) -> Self {
        GenerationTracker { db }
    }

    pub async fn handle_callback(&self, event: CallbackEvent) -> anyhow::Result<CallbackResolution> {
        let CallbackEvent { task_id, outcome } = event;

        let Some(existing) = self.db.get_generation(&task_id).await? else {
            return Ok(CallbackResolution::Unknown { task_id });
        };
        let previous_status = existing.status();

        match outcome {
            CallbackOutcome::InProgress => Ok(CallbackResolution::StillPending { task_id }),
            CallbackOutcome::Completed { video_url } => {
                match self.db.complete_generation(&task_id, &video_url).await? {
                    Some(job) => {
                        info!(
                            "Generation {} for user {} completed",
                            job.task_id, job.user_id
                        );
                        Ok(CallbackResolution::Deliver { job, video_url })
                    }
                    None => {
                        info!(
                            "Ignoring duplicate completion callback for {task_id} (was {:?})",
                            previous_status
                        );
                        Ok(CallbackResolution::Duplicate { task_id })
                    }
                }
            }
            CallbackOutcome::Failed { reason } => {
                match self
                    .db
                    .settle_with_refund(&task_id, GenerationStatus::Failed, reason.as_deref())
                    .await?
                {
                    Some(job) => {
                        warn!(
                            "Generation {} for user {} failed: {}",
                            job.task_id,
                            job.user_id,
                            reason.as_deref().unwrap_or("no reason given")
                        );
                        Ok(CallbackResolution::Refunded { job, reason })
                    }
                    None => {
                        info!(
                            "Ignoring failure callback for already settled {task_id} (was {:?})",
                            previous_status
                        );
                        Ok(CallbackResolution::Duplicate { task_id })
                    }
                }
            }
        }
    }

    /// Expires and refunds jobs that have been pending longer than `max_age`.
    /// A completion that arrives later is still delivered.
    pub async fn expire_stale(&self, max_age: Duration) -> anyhow::Result<Vec<GenerationRow>> {
        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now_unix_seconds().saturating_sub(max_age);
        let stale = self.db.pending_generations_before(cutoff).await?;

        let mut expired = Vec::new();
        for job in stale {
            if let Some(row) = self
                .db
                .settle_with_refund(
                    &job.task_id,
                    GenerationStatus::Expired,
                    Some("no callback received in time"),
                )
                .await?
            {
                expired.push(row);
            }
        }
        if !expired.is_empty() {
            warn!("Expired {} stale generation(s)", expired.len());
        }
        Ok(expired)
    }

    pub async fn pending_count(&self) -> anyhow::Result<i64> {
        self.db.count_pending_generations().await
    }

    pub async fn pending_for_user(&self, user_id: i64) -> anyhow::Result<Vec<GenerationRow>> {
        self.db.pending_generations_for_user(user_id).await
    }
}

/// Charges, submits and records new jobs.
pub struct GenerationManager<P> {
    db: Database,
    tracker: GenerationTracker,
    provider: Arc<P>,
    cost: i64,
}

impl<P> Clone for GenerationManager<P> {
    fn clone(&self) -> Self {
        GenerationManager {
            db: self.db.clone(),
            tracker: self.tracker.clone(),
            provider: Arc::clone(&self.provider),
            cost: self.cost,
        }
    }
}

impl<P: VideoProvider> GenerationManager<P> {
    pub fn new(db: Database, provider: P, cost: i64) -> Self {
        GenerationManager {
            tracker: GenerationTracker::new(db.clone()),
            db,
            provider: Arc::new(provider),
            cost,
        }
    }

    pub fn tracker(&self) -> &GenerationTracker {
        &self.tracker
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub async fn start(&self, job: NewGeneration) -> Result<PendingGeneration, GenerationError> {
        let Some(remaining_credits) = self.db.try_deduct_credits(job.user_id, self.cost).await?
        else {
            let balance = self.db.get_credits(job.user_id).await?;
            return Err(GenerationError::InsufficientCredits {
                balance,
                cost: self.cost,
            });
        };

        let request = GenerationRequest {
            model: job.model,
            prompt: job.prompt.clone(),
            image_url: job.image_url.clone(),
        };

        let task_id = match self.provider.submit(&request).await {
            Ok(task_id) => task_id,
            Err(err) => {
                error!("Generation error for user {}: {err}", job.user_id);
                return Err(self.refund(job.user_id, err.into()).await);
            }
        };

        let insert = GenerationInsert {
            task_id: task_id.clone(),
            user_id: job.user_id,
            chat_id: job.chat_id,
            model: job.model.key().to_string(),
            prompt: job.prompt,
            image_url: job.image_url,
            cost: self.cost,
            created_at: now_unix_seconds(),
        };
        if let Err(err) = self.db.insert_generation(&insert).await {
            error!("Failed to record generation {task_id}: {err}");
            return Err(self.refund(job.user_id, err.into()).await);
        }

        info!(
            "Generation {} started for user {} with {}",
            task_id, job.user_id, job.model
        );
        Ok(PendingGeneration {
            task_id,
            model: job.model,
            remaining_credits,
        })
    }

    /// Returns the charge taken by `start` and hands back the error to
    /// report. When the refund itself fails the caller gets `RefundFailed`.
    async fn refund(&self, user_id: i64, cause: GenerationError) -> GenerationError {
        match self.db.add_credits(user_id, self.cost).await {
            Ok(_) => cause,
            Err(err) => {
                error!("Failed to refund {} credits to user {user_id}: {err}", self.cost);
                GenerationError::RefundFailed {
                    cause: cause.to_string(),
                    cost: self.cost,
                    refund_error: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, ProviderError>>>,
        seen: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedProvider {
        fn returning(responses: Vec<Result<String, ProviderError>>) -> Self {
            ScriptedProvider {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl VideoProvider for ScriptedProvider {
        async fn submit(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
            self.seen.lock().push(request.clone());
            self.responses
                .lock()
                .pop()
                .unwrap_or(Err(ProviderError::MissingTaskId))
        }
    }

    /// Loses the database mid-request, so the refund after its failure
    /// cannot be written.
    struct DatabaseLosingProvider {
        db: Database,
    }

    impl VideoProvider for DatabaseLosingProvider {
        async fn submit(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
            self.db.close().await;
            Err(ProviderError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }

    async fn setup(
        responses: Vec<Result<String, ProviderError>>,
    ) -> (Database, GenerationManager<ScriptedProvider>) {
        let db = Database::init("sqlite::memory:").await.unwrap();
        let manager = GenerationManager::new(db.clone(), ScriptedProvider::returning(responses), 1);
        (db, manager)
    }

    fn new_job(user_id: i64, image_url: Option<&str>) -> NewGeneration {
        NewGeneration {
            user_id,
            chat_id: user_id,
            model: VideoModel::Kling21,
            prompt: "waves at sunset".to_string(),
            image_url: image_url.map(str::to_string),
        }
    }

    fn completed(task_id: &str) -> CallbackEvent {
        CallbackEvent {
            task_id: task_id.to_string(),
            outcome: CallbackOutcome::Completed {
                video_url: "https://cdn.example/out.mp4".to_string(),
            },
        }
    }

    fn failed(task_id: &str) -> CallbackEvent {
        CallbackEvent {
            task_id: task_id.to_string(),
            outcome: CallbackOutcome::Failed {
                reason: Some("nsfw".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn start_without_credits_submits_nothing() {
        let (_db, manager) = setup(vec![Ok("t1".to_string())]).await;
        let err = manager.start(new_job(5, None)).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::InsufficientCredits { balance: 0, cost: 1 }
        ));
        assert!(manager.provider().seen.lock().is_empty());
    }

    #[tokio::test]
    async fn start_charges_and_records_the_job() {
        let (db, manager) = setup(vec![Ok("t1".to_string())]).await;
        db.add_credits(5, 2).await.unwrap();

        let pending = manager
            .start(new_job(5, Some("https://bot.example/uploads/x.jpg")))
            .await
            .unwrap();
        assert_eq!(pending.task_id, "t1");
        assert_eq!(pending.remaining_credits, 1);

        let row = db.get_generation("t1").await.unwrap().unwrap();
        assert_eq!(row.user_id, 5);
        assert_eq!(row.model, "kling_v2.1");
        assert_eq!(row.image_url.as_deref(), Some("https://bot.example/uploads/x.jpg"));
        assert_eq!(row.status(), Some(GenerationStatus::Pending));

        let seen = manager.provider().seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].prompt, "waves at sunset");
    }

    #[tokio::test]
    async fn provider_error_refunds_the_charge() {
        let (db, manager) = setup(vec![Err(ProviderError::Rejected {
            code: 402,
            message: "Insufficient balance".to_string(),
        })])
        .await;
        db.add_credits(5, 1).await.unwrap();

        let err = manager.start(new_job(5, None)).await.unwrap_err();
        assert!(matches!(err, GenerationError::Provider(_)));
        assert_eq!(db.get_credits(5).await.unwrap(), 1);
        assert_eq!(manager.tracker().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_refund_is_reported_instead_of_the_provider_error() {
        let db = Database::init("sqlite::memory:").await.unwrap();
        db.add_credits(5, 1).await.unwrap();
        let manager = GenerationManager::new(
            db.clone(),
            DatabaseLosingProvider { db: db.clone() },
            1,
        );

        let err = manager.start(new_job(5, None)).await.unwrap_err();
        match err {
            GenerationError::RefundFailed { cause, cost, .. } => {
                assert_eq!(cost, 1);
                assert!(cause.contains("503"), "cause was {cause}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn completion_is_delivered_once() {
        let (db, manager) = setup(vec![Ok("t1".to_string())]).await;
        db.add_credits(5, 1).await.unwrap();
        manager.start(new_job(5, None)).await.unwrap();

        let tracker = manager.tracker();
        let first = tracker.handle_callback(completed("t1")).await.unwrap();
        match first {
            CallbackResolution::Deliver { job, video_url } => {
                assert_eq!(job.user_id, 5);
                assert_eq!(video_url, "https://cdn.example/out.mp4");
            }
            other => panic!("unexpected resolution {other:?}"),
        }

        let second = tracker.handle_callback(completed("t1")).await.unwrap();
        assert!(matches!(second, CallbackResolution::Duplicate { .. }));
        let late_failure = tracker.handle_callback(failed("t1")).await.unwrap();
        assert!(matches!(late_failure, CallbackResolution::Duplicate { .. }));
        assert_eq!(db.get_credits(5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_refunds_exactly_once() {
        let (db, manager) = setup(vec![Ok("t1".to_string())]).await;
        db.add_credits(5, 1).await.unwrap();
        manager.start(new_job(5, None)).await.unwrap();
        assert_eq!(db.get_credits(5).await.unwrap(), 0);

        let tracker = manager.tracker();
        let first = tracker.handle_callback(failed("t1")).await.unwrap();
        assert!(matches!(
            first,
            CallbackResolution::Refunded { ref reason, .. } if reason.as_deref() == Some("nsfw")
        ));
        let again = tracker.handle_callback(failed("t1")).await.unwrap();
        assert!(matches!(again, CallbackResolution::Duplicate { .. }));
        assert_eq!(db.get_credits(5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_failure_callbacks_refund_once() {
        let (db, manager) = setup(vec![Ok("t1".to_string())]).await;
        db.add_credits(5, 1).await.unwrap();
        manager.start(new_job(5, None)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = manager.tracker().clone();
            handles.push(tokio::spawn(async move {
                tracker.handle_callback(failed("t1")).await.unwrap()
            }));
        }
        let mut refunds = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), CallbackResolution::Refunded { .. }) {
                refunds += 1;
            }
        }
        assert_eq!(refunds, 1);
        assert_eq!(db.get_credits(5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_and_in_progress_callbacks_change_nothing() {
        let (db, manager) = setup(vec![Ok("t1".to_string())]).await;
        db.add_credits(5, 1).await.unwrap();
        manager.start(new_job(5, None)).await.unwrap();
        let tracker = manager.tracker();

        let unknown = tracker.handle_callback(completed("nope")).await.unwrap();
        assert!(matches!(unknown, CallbackResolution::Unknown { .. }));

        let running = tracker
            .handle_callback(CallbackEvent {
                task_id: "t1".to_string(),
                outcome: CallbackOutcome::InProgress,
            })
            .await
            .unwrap();
        assert!(matches!(running, CallbackResolution::StillPending { .. }));
        assert_eq!(tracker.pending_count().await.unwrap(), 1);
        assert_eq!(tracker.pending_for_user(5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_jobs_are_refunded_and_late_videos_still_delivered() {
        let (db, manager) = setup(vec![]).await;
        db.add_credits(5, 1).await.unwrap();
        db.try_deduct_credits(5, 1).await.unwrap();
        db.insert_generation(&GenerationInsert {
            task_id: "old".to_string(),
            user_id: 5,
            chat_id: 5,
            model: "veo3_fast".to_string(),
            prompt: "p".to_string(),
            image_url: None,
            cost: 1,
            created_at: now_unix_seconds() - 3600,
        })
        .await
        .unwrap();

        let tracker = manager.tracker();
        let expired = tracker.expire_stale(Duration::from_secs(600)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(db.get_credits(5).await.unwrap(), 1);
        assert!(tracker
            .expire_stale(Duration::from_secs(600))
            .await
            .unwrap()
            .is_empty());

        let late = tracker.handle_callback(completed("old")).await.unwrap();
        assert!(matches!(late, CallbackResolution::Deliver { .. }));
        assert_eq!(db.get_credits(5).await.unwrap(), 1);
    }
}
