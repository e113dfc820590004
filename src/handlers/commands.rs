use anyhow::Result;
use chrono::Utc;
use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::handlers::access::check_admin_access;
use crate::state::AppState;
use crate::utils::telegram::message_user_id;
use crate::utils::timing::{complete_command_timer, start_command_timer};
use crate::Command;

const GIVE_CREDITS_USAGE: &str = "Usage: /give_credits <user_id> <amount>";

fn bool_label(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn credits_label(credits: i64) -> &'static str {
    if credits == 1 {
        "credit"
    } else {
        "credits"
    }
}

pub fn parse_give_credits_args(args: &str) -> Result<(i64, i64), &'static str> {
    let mut parts = args.split_whitespace();
    let (Some(user_id), Some(amount), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(GIVE_CREDITS_USAGE);
    };
    let user_id = user_id
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or("❌ User id must be a positive number.")?;
    let amount = amount
        .parse::<i64>()
        .ok()
        .filter(|amount| *amount > 0)
        .ok_or("❌ Amount must be a positive number.")?;
    Ok((user_id, amount))
}

fn welcome_text(credits: i64) -> String {
    format!(
        "🎬 Welcome to the AI Video Generator Bot!\n\n\
         Your current credits: {credits}\n\n\
         Available commands:\n\
         /generate - Generate a video\n\
         /model - Choose the video model\n\
         /buy - Purchase credits\n\
         /credits - Show your balance\n\
         /help - Show all commands\n\n\
         Each video generation costs {cost} {unit} ({price} ⭐ per credit).",
        cost = CONFIG.generation_cost,
        unit = credits_label(CONFIG.generation_cost),
        price = CONFIG.credit_price_stars,
    )
}

pub async fn start_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let credits = match message_user_id(&message) {
        Some(user_id) => state.db.get_credits(user_id).await?,
        None => 0,
    };
    bot.send_message(message.chat.id, welcome_text(credits))
        .await?;
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    bot.send_message(message.chat.id, Command::descriptions().to_string())
        .await?;
    Ok(())
}

pub async fn credits_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };
    let credits = state.db.get_credits(user_id).await?;
    let pending = state.generations.tracker().pending_for_user(user_id).await?;

    let mut text = format!("💰 You have {credits} {}.", credits_label(credits));
    if !pending.is_empty() {
        text.push_str(&format!(
            "\n⏳ Videos in progress: {}",
            pending.len()
        ));
    }
    bot.send_message(message.chat.id, text).await?;
    Ok(())
}

pub async fn give_credits_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    args: String,
) -> Result<()> {
    let mut timer = start_command_timer("give_credits", &message);
    if !check_admin_access(&bot, &message, "give_credits").await {
        complete_command_timer(&mut timer, "denied", None);
        return Ok(());
    }

    let (user_id, amount) = match parse_give_credits_args(&args) {
        Ok(parsed) => parsed,
        Err(reply) => {
            complete_command_timer(&mut timer, "invalid_args", None);
            bot.send_message(message.chat.id, reply)
                .reply_parameters(ReplyParameters::new(message.id))
                .await?;
            return Ok(());
        }
    };

    let balance = state.db.add_credits(user_id, amount).await?;
    info!(
        "Admin {:?} gave {amount} credits to user {user_id}",
        message_user_id(&message)
    );
    bot.send_message(
        message.chat.id,
        format!(
            "✅ Added {amount} {} to user {user_id}.\nNew balance: {balance}",
            credits_label(amount)
        ),
    )
    .reply_parameters(ReplyParameters::new(message.id))
    .await?;

    if let Err(err) = bot
        .send_message(
            ChatId(user_id),
            format!(
                "🎁 You received {amount} {}!\nTotal credits: {balance}",
                credits_label(amount)
            ),
        )
        .await
    {
        warn!("Could not notify user {user_id} about granted credits: {err}");
    }
    Ok(())
}

async fn build_status_report(state: &AppState) -> String {
    let db_result = state.db.health_check().await;
    let db_status = if db_result.is_ok() { "ok" } else { "error" };
    let db_detail = db_result.err().map(|err| err.to_string());
    let pending = state.generations.tracker().pending_count().await;

    let mut report = String::new();
    report.push_str("Status snapshot\n");
    report.push_str(&format!("time_utc: {}\n", Utc::now().to_rfc3339()));
    report.push_str(&format!("db: {db_status}\n"));
    if let Some(detail) = db_detail {
        report.push_str(&format!("db_error: {detail}\n"));
    }
    match pending {
        Ok(count) => report.push_str(&format!("pending_generations: {count}\n")),
        Err(err) => report.push_str(&format!("pending_generations_error: {err}\n")),
    }
    report.push_str(&format!(
        "kie_configured: {}\n",
        bool_label(state.generations.provider().is_configured())
    ));
    report.push_str(&format!(
        "webhook_url_configured: {}\n",
        bool_label(!CONFIG.webhook_url.trim().is_empty())
    ));
    report.push_str(&format!(
        "callback_secret_configured: {}\n",
        bool_label(CONFIG.callback_secret.is_some())
    ));
    report.push_str(&format!("admins: {}\n", CONFIG.admin_user_ids.len()));
    report.push_str(&format!("generation_cost: {}\n", CONFIG.generation_cost));
    report.push_str(&format!(
        "generation_timeout_minutes: {}\n",
        CONFIG.generation_timeout_minutes
    ));
    report.push_str(&format!(
        "upload_dir: {}\n",
        state.uploads.dir().display()
    ));
    report
}

pub async fn status_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_admin_access(&bot, &message, "status").await {
        return Ok(());
    }

    let report = build_status_report(&state).await;
    bot.send_message(message.chat.id, report)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}
