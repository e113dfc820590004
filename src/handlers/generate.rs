use anyhow::Result;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::prelude::*;
use teloxide::types::{FileId, InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage};
use tracing::{error, info, warn};

use crate::config::CONFIG;
use crate::generation::{GenerationError, NewGeneration};
use crate::handlers::access::is_rate_limited;
use crate::kie::VideoModel;
use crate::state::AppState;
use crate::utils::media::download_media;
use crate::utils::telegram::{message_user_id, user_id_of};
use crate::utils::timing::{complete_command_timer, start_command_timer};

pub const MODEL_CALLBACK_PREFIX: &str = "model_";

const PROMPT_REQUEST: &str = "📝 Please enter your text prompt for video generation:";
const IMAGE_REQUEST: &str =
    "🖼️ You can now upload an image (optional) or type 'skip' to proceed without an image:";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum GenerationStep {
    #[default]
    Idle,
    AwaitingPrompt {
        model: VideoModel,
    },
    AwaitingImage {
        model: VideoModel,
        prompt: String,
    },
}

pub type GenerationDialogue = Dialogue<GenerationStep, InMemStorage<GenerationStep>>;

pub fn model_selection_keyboard() -> InlineKeyboardMarkup {
    let rows = VideoModel::all()
        .iter()
        .map(|model| {
            vec![InlineKeyboardButton::callback(
                model.label(),
                format!("{MODEL_CALLBACK_PREFIX}{}", model.key()),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

pub fn parse_model_callback(data: &str) -> Option<VideoModel> {
    data.strip_prefix(MODEL_CALLBACK_PREFIX)
        .and_then(VideoModel::from_key)
}

fn model_selected_text(model: VideoModel) -> String {
    format!("✅ Model selected: {}\n\n{PROMPT_REQUEST}", model.label())
}

fn is_skip(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("skip")
}

fn image_file_id(message: &Message) -> Option<FileId> {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        return Some(photo.file.id.clone());
    }
    message
        .document()
        .filter(|doc| {
            doc.mime_type
                .as_ref()
                .is_some_and(|mime| mime.essence_str().starts_with("image/"))
        })
        .map(|doc| doc.file.id.clone())
}

fn refund_failed_text() -> &'static str {
    "❌ Error starting generation, and your credit could not be returned automatically.\n\
     Please contact an administrator."
}

pub async fn generate_handler(
    bot: Bot,
    state: AppState,
    dialogue: GenerationDialogue,
    message: Message,
) -> Result<()> {
    let mut timer = start_command_timer("generate", &message);
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };

    if is_rate_limited(user_id) {
        complete_command_timer(&mut timer, "rate_limited", None);
        bot.send_message(
            message.chat.id,
            "⏳ Please wait a few seconds before starting another generation.",
        )
        .await?;
        return Ok(());
    }

    let credits = state.db.get_credits(user_id).await?;
    if credits < state.generations.cost() {
        complete_command_timer(&mut timer, "no_credits", None);
        bot.send_message(
            message.chat.id,
            "❌ You don't have enough credits to generate a video.\nUse /buy to purchase credits.",
        )
        .await?;
        return Ok(());
    }

    let Some(model) = state.selected_model(user_id) else {
        bot.send_message(message.chat.id, "🤖 Please select a model for video generation:")
            .reply_markup(model_selection_keyboard())
            .await?;
        return Ok(());
    };

    bot.send_message(
        message.chat.id,
        format!("✨ Selected model: {}\n\n{PROMPT_REQUEST}", model.label()),
    )
    .await?;
    dialogue.update(GenerationStep::AwaitingPrompt { model }).await?;
    Ok(())
}

pub async fn model_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let current = message_user_id(&message)
        .and_then(|user_id| state.selected_model(user_id))
        .map(|model| format!("Current model: {}\n\n", model.label()))
        .unwrap_or_default();
    bot.send_message(
        message.chat.id,
        format!("{current}🤖 Please select a model for video generation:"),
    )
    .reply_markup(model_selection_keyboard())
    .await?;
    Ok(())
}

pub async fn model_selection_callback(
    bot: Bot,
    state: AppState,
    dialogue: GenerationDialogue,
    query: CallbackQuery,
) -> Result<()> {
    if let Err(err) = bot.answer_callback_query(query.id.clone()).await {
        warn!("Failed to answer model callback: {err}");
    }

    let Some(model) = query.data.as_deref().and_then(parse_model_callback) else {
        return Ok(());
    };
    let user_id = user_id_of(&query.from);
    state.select_model(user_id, model);
    info!("User {user_id} selected model {}", model.key());

    let text = model_selected_text(model);
    let edited = match &query.message {
        Some(MaybeInaccessibleMessage::Regular(keyboard_message)) => bot
            .edit_message_text(keyboard_message.chat.id, keyboard_message.id, text.clone())
            .await
            .map_err(|err| warn!("Failed to edit model keyboard: {err}"))
            .is_ok(),
        _ => false,
    };
    if !edited {
        let chat_id = query
            .message
            .as_ref()
            .map(|message| message.chat().id)
            .unwrap_or(ChatId(user_id));
        if let Err(err) = bot.send_message(chat_id, text).await {
            warn!("Failed to confirm model selection for user {user_id}: {err}");
        }
    }
    dialogue.update(GenerationStep::AwaitingPrompt { model }).await?;
    Ok(())
}

pub async fn prompt_handler(
    bot: Bot,
    dialogue: GenerationDialogue,
    model: VideoModel,
    message: Message,
) -> Result<()> {
    let prompt = message.text().map(str::trim).unwrap_or_default();
    if prompt.is_empty() || prompt.starts_with('/') {
        bot.send_message(message.chat.id, "Please provide a text prompt.")
            .await?;
        return Ok(());
    }

    bot.send_message(message.chat.id, IMAGE_REQUEST).await?;
    dialogue
        .update(GenerationStep::AwaitingImage {
            model,
            prompt: prompt.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn image_handler(
    bot: Bot,
    state: AppState,
    dialogue: GenerationDialogue,
    (model, prompt): (VideoModel, String),
    message: Message,
) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };

    let image_url = if message.text().is_some_and(is_skip) {
        None
    } else if let Some(file_id) = image_file_id(&message) {
        match rehost_telegram_image(&bot, &state, &file_id).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("Failed to re-host image from user {user_id}: {err}");
                bot.send_message(
                    message.chat.id,
                    "❌ Could not process that image. Please send another one or type 'skip'.",
                )
                .await?;
                return Ok(());
            }
        }
    } else {
        bot.send_message(
            message.chat.id,
            "❌ Please upload an image or type 'skip' to proceed.",
        )
        .await?;
        return Ok(());
    };

    dialogue.exit().await?;
    bot.send_message(
        message.chat.id,
        "🎬 Starting video generation... This may take a few minutes.",
    )
    .await?;

    let job = NewGeneration {
        user_id,
        chat_id: message.chat.id.0,
        model,
        prompt,
        image_url,
    };
    match state.generations.start(job).await {
        Ok(pending) => {
            bot.send_message(
                message.chat.id,
                format!(
                    "✅ Video generation started!\nGeneration ID: {}\nModel: {}\nCredits left: {}\nYou'll receive the video when it's ready.",
                    pending.task_id,
                    pending.model.label(),
                    pending.remaining_credits
                ),
            )
            .await?;
        }
        Err(GenerationError::InsufficientCredits { .. }) => {
            bot.send_message(message.chat.id, "❌ Insufficient credits!")
                .await?;
        }
        Err(err @ GenerationError::RefundFailed { .. }) => {
            error!("Generation error for user {user_id}, credits not returned: {err}");
            bot.send_message(message.chat.id, refund_failed_text())
                .await?;
        }
        Err(err) => {
            error!("Generation error for user {user_id}: {err}");
            bot.send_message(
                message.chat.id,
                format!("❌ Error starting generation: {err}\nCredits refunded."),
            )
            .await?;
        }
    }
    Ok(())
}

pub async fn cancel_handler(bot: Bot, dialogue: GenerationDialogue, message: Message) -> Result<()> {
    let step = dialogue.get().await?.unwrap_or_default();
    let text = if step == GenerationStep::Idle {
        "Nothing to cancel."
    } else {
        dialogue.exit().await?;
        "❎ Generation cancelled."
    };
    bot.send_message(message.chat.id, text).await?;
    Ok(())
}

/// Copies a Telegram file to the upload store, so the provider gets a URL
/// without the bot token in it.
async fn rehost_telegram_image(bot: &Bot, state: &AppState, file_id: &FileId) -> Result<String> {
    let file = bot.get_file(file_id.clone()).await?;
    let telegram_url = format!(
        "https://api.telegram.org/file/bot{}/{}",
        CONFIG.bot_token, file.path
    );
    let bytes = download_media(&telegram_url, state.uploads.max_bytes() as u64).await?;
    let stored = state.uploads.save(&bytes).await?;
    Ok(stored.url)
}
