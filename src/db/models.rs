use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(GenerationStatus::Pending),
            "completed" => Some(GenerationStatus::Completed),
            "failed" => Some(GenerationStatus::Failed),
            "expired" => Some(GenerationStatus::Expired),
            _ => None,
        }
    }
}

/// A persisted generation job. Timestamps are unix seconds.
#[derive(Debug, Clone, FromRow)]
pub struct GenerationRow {
    pub task_id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub model: String,
    pub prompt: String,
    pub image_url: Option<String>,
    pub status: String,
    pub cost: i64,
    pub video_url: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub settled_at: Option<i64>,
}

impl GenerationRow {
    pub fn status(&self) -> Option<GenerationStatus> {
        GenerationStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationInsert {
    pub task_id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub model: String,
    pub prompt: String,
    pub image_url: Option<String>,
    pub cost: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct PaymentInsert {
    pub charge_id: String,
    pub user_id: i64,
    pub credits: i64,
    pub stars: i64,
    pub payload: String,
}
