use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use dotenvy::dotenv;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::types::{PreCheckoutQuery, SuccessfulPayment};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

mod config;
mod db;
mod generation;
mod handlers;
mod kie;
mod server;
mod state;
mod utils;

use config::CONFIG;
use db::database::Database;
use generation::{GenerationManager, GenerationTracker};
use handlers::delivery::TelegramNotifier;
use handlers::generate::{GenerationDialogue, GenerationStep, MODEL_CALLBACK_PREFIX};
use handlers::payments::BUY_CALLBACK_PREFIX;
use handlers::{commands, generate, payments};
use kie::{KieClient, VideoModel};
use server::{run_server, signed_callback_url, Notifier, ServerState, UploadStore};
use state::AppState;
use utils::logging::init_logging;

const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
enum Command {
    #[command(description = "show the welcome message and your balance")]
    Start,
    #[command(description = "show this help")]
    Help,
    #[command(description = "generate a video")]
    Generate,
    #[command(description = "choose the video model")]
    Model,
    #[command(description = "purchase credits with Telegram Stars")]
    Buy,
    #[command(description = "show your credit balance")]
    Credits,
    #[command(description = "cancel the current generation request")]
    Cancel,
    #[command(
        rename = "give_credits",
        description = "admin: add credits, /give_credits <user_id> <amount>"
    )]
    GiveCredits(String),
    #[command(description = "admin: health snapshot")]
    Status,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging(&CONFIG.log_level);

    if CONFIG.bot_token.trim().is_empty() {
        return Err("BOT_TOKEN is required".into());
    }
    if CONFIG.kie_api_key.trim().is_empty() {
        warn!("KIE_AI_API_KEY is not set; generations will fail and be refunded");
    }

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!("Starting video generation bot");

    let db = Database::init(&CONFIG.database_url).await?;

    let provider_callback_url =
        signed_callback_url(&CONFIG.callback_url(), CONFIG.callback_secret.as_deref())?;
    let provider = KieClient::new(
        &CONFIG.kie_api_base_url,
        &CONFIG.kie_api_key,
        &provider_callback_url,
        Duration::from_secs(CONFIG.http_timeout_seconds),
    )?
    .with_veo_aspect_ratio(&CONFIG.veo_aspect_ratio)
    .with_kling_duration(&CONFIG.kling_duration);
    let generations = GenerationManager::new(db.clone(), provider, CONFIG.generation_cost);

    let uploads =
        UploadStore::new(&CONFIG.upload_dir, &CONFIG.webhook_url, CONFIG.max_upload_bytes).await?;
    let notifier = TelegramNotifier::new(bot.clone(), CONFIG.telegram_max_video_bytes);

    let addr: SocketAddr = format!("{}:{}", CONFIG.server_host, CONFIG.server_port).parse()?;
    let server_state = ServerState {
        tracker: generations.tracker().clone(),
        notifier: notifier.clone(),
        uploads: uploads.clone(),
        callback_url: CONFIG.callback_url(),
        callback_secret: CONFIG.callback_secret.clone(),
    };
    tokio::spawn(async move {
        if let Err(err) = run_server(addr, server_state).await {
            error!("Callback server stopped: {err}");
        }
    });

    if CONFIG.generation_timeout_minutes > 0 {
        spawn_stale_sweeper(
            generations.tracker().clone(),
            notifier,
            Duration::from_secs(CONFIG.generation_timeout_minutes.saturating_mul(60)),
        );
    } else {
        info!("Stale generation sweeper disabled");
    }

    if let Err(err) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {err}");
    }

    let state = AppState::new(db.clone(), generations, uploads);

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .enter_dialogue::<Message, InMemStorage<GenerationStep>, GenerationStep>()
        .branch(
            dptree::filter_map(|msg: Message| msg.successful_payment().cloned())
                .endpoint(handle_successful_payment),
        )
        .branch(command_handler)
        .branch(dptree::case![GenerationStep::AwaitingPrompt { model }].endpoint(handle_prompt))
        .branch(
            dptree::case![GenerationStep::AwaitingImage { model, prompt }].endpoint(handle_image),
        )
        .endpoint(ignore_message);

    let callback_handler = Update::filter_callback_query()
        .enter_dialogue::<CallbackQuery, InMemStorage<GenerationStep>, GenerationStep>()
        .endpoint(handle_callback_query);

    let pre_checkout_handler =
        Update::filter_pre_checkout_query().endpoint(handle_pre_checkout);

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler)
        .branch(pre_checkout_handler);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state, InMemStorage::<GenerationStep>::new()])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    db.close().await;
    info!("Bot stopped");
    Ok(())
}

/// Periodically expires jobs the provider never called back about, refunding
/// and notifying their owners.
fn spawn_stale_sweeper<N: Notifier>(tracker: GenerationTracker, notifier: N, max_age: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STALE_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match tracker.expire_stale(max_age).await {
                Ok(expired) => {
                    for job in expired {
                        let reason = job.failure_reason.clone();
                        notifier.generation_failed(job, reason).await;
                    }
                }
                Err(err) => error!("Stale generation sweep failed: {err}"),
            }
        }
    });
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    dialogue: GenerationDialogue,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, state, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Generate => generate::generate_handler(bot, state, dialogue, message).await?,
        Command::Model => generate::model_handler(bot, state, message).await?,
        Command::Buy => payments::buy_handler(bot, message).await?,
        Command::Credits => commands::credits_handler(bot, state, message).await?,
        Command::Cancel => generate::cancel_handler(bot, dialogue, message).await?,
        Command::GiveCredits(args) => {
            commands::give_credits_handler(bot, state, message, args).await?
        }
        Command::Status => {
            let bot = bot.clone();
            let state = state.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(err) = commands::status_handler(bot, state, message).await {
                    error!("status handler failed: {err}");
                }
            });
        }
    }
    Ok(())
}

async fn handle_prompt(
    bot: Bot,
    dialogue: GenerationDialogue,
    model: VideoModel,
    message: Message,
) -> HandlerResult {
    generate::prompt_handler(bot, dialogue, model, message).await?;
    Ok(())
}

async fn handle_image(
    bot: Bot,
    state: AppState,
    dialogue: GenerationDialogue,
    step: (VideoModel, String),
    message: Message,
) -> HandlerResult {
    generate::image_handler(bot, state, dialogue, step, message).await?;
    Ok(())
}

async fn handle_callback_query(
    bot: Bot,
    state: AppState,
    dialogue: GenerationDialogue,
    query: CallbackQuery,
) -> HandlerResult {
    let Some(data) = query.data.clone() else {
        return Ok(());
    };
    if data.starts_with(MODEL_CALLBACK_PREFIX) {
        generate::model_selection_callback(bot, state, dialogue, query).await?;
    } else if data.starts_with(BUY_CALLBACK_PREFIX) {
        payments::buy_callback(bot, query).await?;
    } else {
        bot.answer_callback_query(query.id.clone()).await?;
    }
    Ok(())
}

async fn handle_pre_checkout(bot: Bot, query: PreCheckoutQuery) -> HandlerResult {
    payments::pre_checkout_handler(bot, query).await?;
    Ok(())
}

async fn handle_successful_payment(
    bot: Bot,
    state: AppState,
    message: Message,
    payment: SuccessfulPayment,
) -> HandlerResult {
    payments::successful_payment_handler(bot, state, message, payment).await?;
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
