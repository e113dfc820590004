use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile};
use tracing::{error, info, warn};

use crate::db::models::GenerationRow;
use crate::server::Notifier;
use crate::utils::media::download_media;
use crate::utils::telegram::{send_message_with_retry, start_chat_action_heartbeat, with_telegram_retry};

const VIDEO_READY_CAPTION: &str = "🎬 Your video is ready!";

/// Delivers settled jobs to the chat that started them.
#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
    max_video_bytes: u64,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, max_video_bytes: u64) -> Self {
        TelegramNotifier {
            bot,
            max_video_bytes,
        }
    }

    async fn send_video(&self, chat_id: ChatId, task_id: &str, video_url: &str) -> anyhow::Result<()> {
        let _heartbeat = start_chat_action_heartbeat(self.bot.clone(), chat_id, ChatAction::UploadVideo);
        let bytes = download_media(video_url, self.max_video_bytes).await?;
        let file_name = format!("video_{task_id}.mp4");

        with_telegram_retry("send_video", || {
            let request = self
                .bot
                .send_video(chat_id, InputFile::memory(bytes.clone()).file_name(file_name.clone()))
                .caption(VIDEO_READY_CAPTION);
            async move { request.await }
        })
        .await?;
        Ok(())
    }
}

pub fn video_link_text(video_url: &str) -> String {
    format!("✅ Video generated successfully!\nDownload: {video_url}")
}

pub fn failure_text(reason: Option<&str>) -> String {
    let mut text = String::from("❌ Video generation failed. Your credit has been refunded.");
    if let Some(reason) = reason.map(str::trim).filter(|reason| !reason.is_empty()) {
        text.push_str(&format!("\nReason: {reason}"));
    }
    text
}

impl Notifier for TelegramNotifier {
    async fn video_ready(&self, job: GenerationRow, video_url: String) {
        let chat_id = ChatId(job.chat_id);
        match self.send_video(chat_id, &job.task_id, &video_url).await {
            Ok(()) => {
                info!("Video sent to user {} for {}", job.user_id, job.task_id);
                return;
            }
            Err(err) => warn!("Falling back to a link for {}: {err}", job.task_id),
        }

        if let Err(err) = send_message_with_retry(&self.bot, chat_id, &video_link_text(&video_url)).await {
            error!("Failed to deliver {} to user {}: {err}", job.task_id, job.user_id);
        }
    }

    async fn generation_failed(&self, job: GenerationRow, reason: Option<String>) {
        let text = failure_text(reason.as_deref());
        if let Err(err) = send_message_with_retry(&self.bot, ChatId(job.chat_id), &text).await {
            error!(
                "Failed to notify user {} about failed {}: {err}",
                job.user_id, job.task_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_text_includes_known_reason() {
        assert_eq!(
            failure_text(None),
            "❌ Video generation failed. Your credit has been refunded."
        );
        assert_eq!(
            failure_text(Some("  ")),
            "❌ Video generation failed. Your credit has been refunded."
        );
        assert_eq!(
            failure_text(Some("content policy")),
            "❌ Video generation failed. Your credit has been refunded.\nReason: content policy"
        );
    }

    #[test]
    fn link_text_carries_url() {
        assert_eq!(
            video_link_text("https://cdn.example/v.mp4"),
            "✅ Video generated successfully!\nDownload: https://cdn.example/v.mp4"
        );
    }
}
