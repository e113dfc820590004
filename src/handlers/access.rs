use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use teloxide::prelude::*;
use tracing::warn;

use crate::config::CONFIG;
use crate::utils::telegram::message_user_id;

static RATE_LIMITS: Lazy<Mutex<HashMap<i64, Instant>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn is_rate_limited(user_id: i64) -> bool {
    check_rate_limit(&RATE_LIMITS, user_id, Duration::from_secs(CONFIG.rate_limit_seconds))
}

fn check_rate_limit(limits: &Mutex<HashMap<i64, Instant>>, user_id: i64, window: Duration) -> bool {
    if window.is_zero() {
        return false;
    }
    let mut limits = limits.lock();
    let now = Instant::now();
    limits.retain(|_, last| now.duration_since(*last) < window);

    if let Some(last) = limits.get(&user_id) {
        if now.duration_since(*last) < window {
            return true;
        }
    }

    limits.insert(user_id, now);
    false
}

pub async fn check_admin_access(bot: &Bot, message: &Message, command: &str) -> bool {
    let user_id = message_user_id(message).unwrap_or_default();
    if CONFIG.is_admin(user_id) {
        return true;
    }

    warn!("User {user_id} tried admin command /{command}");
    let _ = bot
        .send_message(message.chat.id, "❌ This command is only available to administrators.")
        .await;
    false
}
