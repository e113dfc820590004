use anyhow::{anyhow, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::db::models::{GenerationInsert, GenerationRow, GenerationStatus, PaymentInsert};

const GENERATION_COLUMNS: &str = "task_id, user_id, chat_id, model, prompt, image_url, status, cost, \
     video_url, failure_reason, created_at, settled_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

pub fn now_unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database sees its own empty schema.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(database_url)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await?
        };

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_credits (\
                user_id INTEGER PRIMARY KEY,\
                credits INTEGER NOT NULL DEFAULT 0 CHECK (credits >= 0),\
                updated_at INTEGER NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS generations (\
                task_id TEXT PRIMARY KEY,\
                user_id INTEGER NOT NULL,\
                chat_id INTEGER NOT NULL,\
                model TEXT NOT NULL,\
                prompt TEXT NOT NULL,\
                image_url TEXT,\
                status TEXT NOT NULL DEFAULT 'pending',\
                cost INTEGER NOT NULL,\
                video_url TEXT,\
                failure_reason TEXT,\
                created_at INTEGER NOT NULL,\
                settled_at INTEGER\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_generations_status_created ON generations(status, created_at);",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_generations_user_id ON generations(user_id);")
            .execute(&pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS payments (\
                charge_id TEXT PRIMARY KEY,\
                user_id INTEGER NOT NULL,\
                credits INTEGER NOT NULL,\
                stars INTEGER NOT NULL,\
                payload TEXT NOT NULL,\
                created_at INTEGER NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        info!("Database tables created successfully");

        Ok(Database { pool })
    }

    /// Waits for in-flight queries and closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get_credits(&self, user_id: i64) -> Result<i64> {
        let credits = sqlx::query_scalar::<_, i64>(
            "SELECT credits FROM user_credits WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credits.unwrap_or(0))
    }

    /// Adds credits and returns the new balance.
    pub async fn add_credits(&self, user_id: i64, amount: i64) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        let balance = add_credits_on(&mut *conn, user_id, amount).await?;
        info!("Added {amount} credits to user {user_id}. Total: {balance}");
        Ok(balance)
    }

    /// Deducts credits only when the balance covers `amount`. Returns the
    /// remaining balance, or `None` when the user cannot afford it.
    pub async fn try_deduct_credits(&self, user_id: i64, amount: i64) -> Result<Option<i64>> {
        if amount <= 0 {
            return Err(anyhow!("Deduction amount must be positive, got {amount}"));
        }
        let remaining = sqlx::query_scalar::<_, i64>(
            "UPDATE user_credits SET credits = credits - ?, updated_at = ? \
             WHERE user_id = ? AND credits >= ? RETURNING credits",
        )
        .bind(amount)
        .bind(now_unix_seconds())
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(remaining) = remaining {
            info!("Deducted {amount} credits from user {user_id}. Remaining: {remaining}");
        }
        Ok(remaining)
    }

    /// Records a payment and credits the buyer in one transaction. A charge id
    /// that was already recorded credits nothing and yields `None`.
    pub async fn credit_payment(&self, payment: &PaymentInsert) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO payments (charge_id, user_id, credits, stars, payload, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&payment.charge_id)
        .bind(payment.user_id)
        .bind(payment.credits)
        .bind(payment.stars)
        .bind(&payment.payload)
        .bind(now_unix_seconds())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let balance = add_credits_on(&mut *tx, payment.user_id, payment.credits).await?;
        tx.commit().await?;
        info!(
            "Payment {} credited {} credits to user {}. Total: {}",
            payment.charge_id, payment.credits, payment.user_id, balance
        );
        Ok(Some(balance))
    }

    pub async fn insert_generation(&self, insert: &GenerationInsert) -> Result<()> {
        sqlx::query(
            "INSERT INTO generations \
             (task_id, user_id, chat_id, model, prompt, image_url, status, cost, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&insert.task_id)
        .bind(insert.user_id)
        .bind(insert.chat_id)
        .bind(&insert.model)
        .bind(&insert.prompt)
        .bind(&insert.image_url)
        .bind(insert.cost)
        .bind(insert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_generation(&self, task_id: &str) -> Result<Option<GenerationRow>> {
        let query = format!("SELECT {GENERATION_COLUMNS} FROM generations WHERE task_id = ?");
        let row = sqlx::query_as::<_, GenerationRow>(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Marks a job completed if it is still pending or expired. Returns the
    /// updated row only for the caller that performed the transition.
    pub async fn complete_generation(
        &self,
        task_id: &str,
        video_url: &str,
    ) -> Result<Option<GenerationRow>> {
        let query = format!(
            "UPDATE generations SET status = ?, video_url = ?, settled_at = ? \
             WHERE task_id = ? AND status IN (?, ?) RETURNING {GENERATION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, GenerationRow>(&query)
            .bind(GenerationStatus::Completed.as_str())
            .bind(video_url)
            .bind(now_unix_seconds())
            .bind(task_id)
            .bind(GenerationStatus::Pending.as_str())
            .bind(GenerationStatus::Expired.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Moves a pending job to `status` and refunds its cost in the same
    /// transaction. Returns the row only when this call performed the move.
    pub async fn settle_with_refund(
        &self,
        task_id: &str,
        status: GenerationStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<GenerationRow>> {
        if !matches!(status, GenerationStatus::Failed | GenerationStatus::Expired) {
            return Err(anyhow!("Refund settlement cannot target {}", status.as_str()));
        }

        let mut tx = self.pool.begin().await?;
        let query = format!(
            "UPDATE generations SET status = ?, failure_reason = ?, settled_at = ? \
             WHERE task_id = ? AND status = ? RETURNING {GENERATION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, GenerationRow>(&query)
            .bind(status.as_str())
            .bind(failure_reason)
            .bind(now_unix_seconds())
            .bind(task_id)
            .bind(GenerationStatus::Pending.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let balance = add_credits_on(&mut *tx, row.user_id, row.cost).await?;
        tx.commit().await?;
        info!(
            "Refunded {} credits to user {} for generation {} ({}). Total: {}",
            row.cost,
            row.user_id,
            row.task_id,
            status.as_str(),
            balance
        );
        Ok(Some(row))
    }

    pub async fn pending_generations_before(&self, created_before: i64) -> Result<Vec<GenerationRow>> {
        let query = format!(
            "SELECT {GENERATION_COLUMNS} FROM generations \
             WHERE status = ? AND created_at < ? ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, GenerationRow>(&query)
            .bind(GenerationStatus::Pending.as_str())
            .bind(created_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn pending_generations_for_user(&self, user_id: i64) -> Result<Vec<GenerationRow>> {
        let query = format!(
            "SELECT {GENERATION_COLUMNS} FROM generations \
             WHERE status = ? AND user_id = ? ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, GenerationRow>(&query)
            .bind(GenerationStatus::Pending.as_str())
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_pending_generations(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM generations WHERE status = ?",
        )
        .bind(GenerationStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

async fn add_credits_on(conn: &mut SqliteConnection, user_id: i64, amount: i64) -> Result<i64> {
    if user_id <= 0 {
        return Err(anyhow!("Invalid user id {user_id}"));
    }
    if amount <= 0 {
        return Err(anyhow!("Credit amount must be positive, got {amount}"));
    }

    let balance = sqlx::query_scalar::<_, i64>(
        "INSERT INTO user_credits (user_id, credits, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET \
         credits = credits + excluded.credits, \
         updated_at = excluded.updated_at \
         RETURNING credits",
    )
    .bind(user_id)
    .bind(amount)
    .bind(now_unix_seconds())
    .fetch_one(&mut *conn)
    .await?;
    Ok(balance)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::init("sqlite::memory:").await.unwrap()
    }

    fn sample_generation(task_id: &str, user_id: i64, created_at: i64) -> GenerationInsert {
        GenerationInsert {
            task_id: task_id.to_string(),
            user_id,
            chat_id: user_id,
            model: "veo3_fast".to_string(),
            prompt: "a cat surfing".to_string(),
            image_url: None,
            cost: 1,
            created_at,
        }
    }

    #[tokio::test]
    async fn unknown_user_has_zero_credits() {
        let db = memory_db().await;
        assert_eq!(db.get_credits(6791428649).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_then_deduct_tracks_balance() {
        let db = memory_db().await;
        assert_eq!(db.add_credits(7, 5).await.unwrap(), 5);
        assert_eq!(db.add_credits(7, 2).await.unwrap(), 7);
        assert_eq!(db.try_deduct_credits(7, 3).await.unwrap(), Some(4));
        assert_eq!(db.get_credits(7).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn deduct_refuses_overdraft() {
        let db = memory_db().await;
        db.add_credits(7, 1).await.unwrap();
        assert_eq!(db.try_deduct_credits(7, 2).await.unwrap(), None);
        assert_eq!(db.try_deduct_credits(8, 1).await.unwrap(), None);
        assert_eq!(db.get_credits(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_credit_grants_change_nothing() {
        let db = memory_db().await;
        assert!(db.add_credits(0, 10).await.is_err());
        assert!(db.add_credits(7, 0).await.is_err());
        assert!(db.add_credits(7, -3).await.is_err());
        assert_eq!(db.get_credits(0).await.unwrap(), 0);
        assert_eq!(db.get_credits(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credits_survive_reopening_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());

        let db = Database::init(&url).await.unwrap();
        db.add_credits(6791428649, 5).await.unwrap();
        drop(db);

        let reopened = Database::init(&url).await.unwrap();
        assert_eq!(reopened.get_credits(6791428649).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn replayed_payment_credits_once() {
        let db = memory_db().await;
        let payment = PaymentInsert {
            charge_id: "charge-1".to_string(),
            user_id: 9,
            credits: 5,
            stars: 500,
            payload: "credits_5".to_string(),
        };
        assert_eq!(db.credit_payment(&payment).await.unwrap(), Some(5));
        assert_eq!(db.credit_payment(&payment).await.unwrap(), None);
        assert_eq!(db.get_credits(9).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn refund_settlement_happens_once() {
        let db = memory_db().await;
        db.insert_generation(&sample_generation("task-1", 3, 100))
            .await
            .unwrap();

        let first = db
            .settle_with_refund("task-1", GenerationStatus::Failed, Some("boom"))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = db
            .settle_with_refund("task-1", GenerationStatus::Failed, Some("boom"))
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(db.get_credits(3).await.unwrap(), 1);

        let row = db.get_generation("task-1").await.unwrap().unwrap();
        assert_eq!(row.status(), Some(GenerationStatus::Failed));
        assert_eq!(row.failure_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn completion_is_reported_to_a_single_caller() {
        let db = memory_db().await;
        db.insert_generation(&sample_generation("task-2", 3, 100))
            .await
            .unwrap();

        let first = db
            .complete_generation("task-2", "https://cdn.example/v.mp4")
            .await
            .unwrap();
        assert_eq!(
            first.unwrap().video_url.as_deref(),
            Some("https://cdn.example/v.mp4")
        );
        assert!(db
            .complete_generation("task-2", "https://cdn.example/v.mp4")
            .await
            .unwrap()
            .is_none());
        assert!(db
            .settle_with_refund("task-2", GenerationStatus::Failed, None)
            .await
            .unwrap()
            .is_none());
        assert_eq!(db.get_credits(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_queries_filter_by_age_and_user() {
        let db = memory_db().await;
        db.insert_generation(&sample_generation("old", 1, 100))
            .await
            .unwrap();
        db.insert_generation(&sample_generation("new", 2, 500))
            .await
            .unwrap();

        let stale = db.pending_generations_before(200).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].task_id, "old");
        assert_eq!(db.pending_generations_for_user(2).await.unwrap().len(), 1);
        assert_eq!(db.count_pending_generations().await.unwrap(), 2);
    }
}
