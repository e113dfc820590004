use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, LabeledPrice, PreCheckoutQuery, SuccessfulPayment,
};
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::db::models::PaymentInsert;
use crate::state::AppState;
use crate::utils::telegram::{message_user_id, user_id_of};

pub const BUY_CALLBACK_PREFIX: &str = "buy_";
pub const STARS_CURRENCY: &str = "XTR";

const PAYLOAD_PREFIX: &str = "credits_";
const LEGACY_SINGLE_CREDIT_PAYLOAD: &str = "credit_purchase_1";

pub fn invoice_payload(credits: u32) -> String {
    format!("{PAYLOAD_PREFIX}{credits}")
}

/// Credits bought by an invoice payload. Also accepts the single-credit
/// payload issued by earlier releases of the bot.
pub fn parse_invoice_payload(payload: &str) -> Option<u32> {
    if payload == LEGACY_SINGLE_CREDIT_PAYLOAD {
        return Some(1);
    }
    payload
        .strip_prefix(PAYLOAD_PREFIX)
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|credits| *credits > 0)
}

pub fn parse_buy_callback(data: &str, packs: &[u32]) -> Option<u32> {
    data.strip_prefix(BUY_CALLBACK_PREFIX)
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|credits| packs.contains(credits))
}

/// Checks a checkout against the price list. `Err` carries the message shown
/// to the user.
pub fn validate_checkout(
    payload: &str,
    currency: &str,
    total_amount: u32,
    price_per_credit: u32,
) -> Result<u32, String> {
    let credits = parse_invoice_payload(payload).ok_or_else(|| "Unknown purchase.".to_string())?;
    if currency != STARS_CURRENCY {
        return Err(format!("Only {STARS_CURRENCY} payments are accepted."));
    }
    let expected = credits.saturating_mul(price_per_credit);
    if total_amount != expected {
        return Err("The price has changed, please use /buy again.".to_string());
    }
    Ok(credits)
}

fn credits_word(credits: u32) -> &'static str {
    if credits == 1 {
        "credit"
    } else {
        "credits"
    }
}

pub fn buy_keyboard(packs: &[u32]) -> InlineKeyboardMarkup {
    let rows = packs
        .iter()
        .map(|credits| {
            vec![InlineKeyboardButton::callback(
                format!(
                    "{credits} {} - {} ⭐",
                    credits_word(*credits),
                    CONFIG.pack_price(*credits)
                ),
                format!("{BUY_CALLBACK_PREFIX}{credits}"),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

pub async fn buy_handler(bot: Bot, message: Message) -> Result<()> {
    bot.send_message(
        message.chat.id,
        format!(
            "💳 Choose a credit pack. Each video costs {} {}.",
            CONFIG.generation_cost,
            if CONFIG.generation_cost == 1 { "credit" } else { "credits" }
        ),
    )
    .reply_markup(buy_keyboard(&CONFIG.credit_packs))
    .await?;
    Ok(())
}

pub async fn buy_callback(bot: Bot, query: CallbackQuery) -> Result<()> {
    let Some(credits) = query
        .data
        .as_deref()
        .and_then(|data| parse_buy_callback(data, &CONFIG.credit_packs))
    else {
        bot.answer_callback_query(query.id.clone()).await?;
        return Ok(());
    };

    bot.answer_callback_query(query.id.clone()).await?;
    let chat_id = query
        .message
        .as_ref()
        .map(|message| message.chat().id)
        .unwrap_or(ChatId(user_id_of(&query.from)));
    send_credit_invoice(&bot, chat_id, credits).await
}

pub async fn send_credit_invoice(bot: &Bot, chat_id: ChatId, credits: u32) -> Result<()> {
    let label = format!("{credits} Video {}", if credits == 1 { "Credit" } else { "Credits" });
    let prices = vec![LabeledPrice {
        label,
        amount: CONFIG.pack_price(credits),
    }];
    bot.send_invoice(
        chat_id,
        "Video Generation Credits",
        format!(
            "Purchase {credits} {} to generate videos",
            credits_word(credits)
        ),
        invoice_payload(credits),
        STARS_CURRENCY,
        prices,
    )
    .await?;
    Ok(())
}

pub async fn pre_checkout_handler(bot: Bot, query: PreCheckoutQuery) -> Result<()> {
    let user_id = user_id_of(&query.from);
    match validate_checkout(
        &query.invoice_payload,
        &query.currency,
        query.total_amount,
        CONFIG.credit_price_stars,
    ) {
        Ok(_) => {
            bot.answer_pre_checkout_query(query.id.clone(), true).await?;
        }
        Err(reason) => {
            warn!(
                "Rejecting checkout from user {user_id}: payload={} currency={} total={}",
                query.invoice_payload, query.currency, query.total_amount
            );
            bot.answer_pre_checkout_query(query.id.clone(), false)
                .error_message(reason)
                .await?;
        }
    }
    Ok(())
}

pub async fn successful_payment_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    payment: SuccessfulPayment,
) -> Result<()> {
    let Some(user_id) = message_user_id(&message) else {
        return Ok(());
    };
    let Some(credits) = parse_invoice_payload(&payment.invoice_payload) else {
        warn!(
            "Ignoring payment with unknown payload {} from user {user_id}",
            payment.invoice_payload
        );
        return Ok(());
    };

    let insert = PaymentInsert {
        charge_id: payment.telegram_payment_charge_id.to_string(),
        user_id,
        credits: i64::from(credits),
        stars: i64::from(payment.total_amount),
        payload: payment.invoice_payload.clone(),
    };
    match state.db.credit_payment(&insert).await? {
        Some(balance) => {
            bot.send_message(
                message.chat.id,
                format!(
                    "✅ Payment successful!\n{credits} {} added to your account.\nTotal credits: {balance}",
                    credits_word(credits)
                ),
            )
            .await?;
        }
        None => {
            info!("Payment {} was already credited", insert.charge_id);
        }
    }
    Ok(())
}
