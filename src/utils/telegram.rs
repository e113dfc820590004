use std::future::Future;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatAction, User};
use teloxide::RequestError;
use tokio::task::JoinHandle;
use tracing::warn;

const CHAT_ACTION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);
const TELEGRAM_RETRY_ATTEMPTS: usize = 3;

pub struct ChatActionHeartbeat {
    task_handle: Option<JoinHandle<()>>,
}

impl Drop for ChatActionHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub fn start_chat_action_heartbeat(
    bot: Bot,
    chat_id: ChatId,
    action: ChatAction,
) -> ChatActionHeartbeat {
    let task_handle = tokio::spawn(async move {
        loop {
            if let Err(err) = bot.send_chat_action(chat_id, action.clone()).await {
                warn!("send_chat_action failed: {err}");
            }
            tokio::time::sleep(CHAT_ACTION_HEARTBEAT_INTERVAL).await;
        }
    });

    ChatActionHeartbeat {
        task_handle: Some(task_handle),
    }
}

pub fn user_id_of(user: &User) -> i64 {
    i64::try_from(user.id.0).unwrap_or_default()
}

pub fn message_user_id(message: &Message) -> Option<i64> {
    message.from.as_ref().map(user_id_of)
}

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

/// Runs a Telegram request, retrying network failures and flood waits.
pub async fn with_telegram_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequestError>>,
{
    let mut delay = Duration::from_secs_f32(1.5);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt >= TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err);
                }
                warn!("{operation} attempt {attempt} failed: {err}");
                if let RequestError::RetryAfter(wait) = &err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                attempt += 1;
            }
        }
    }
}

pub async fn send_message_with_retry(bot: &Bot, chat_id: ChatId, text: &str) -> Result<Message, RequestError> {
    with_telegram_retry("send_message", || {
        let request = bot.send_message(chat_id, text.to_string());
        async move { request.await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::Seconds;
    use teloxide::ApiError;

    #[tokio::test]
    async fn api_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), RequestError> = with_telegram_retry("test", || {
            calls += 1;
            async { Err(RequestError::Api(ApiError::BotBlocked)) }
        })
        .await;
        assert!(matches!(result, Err(RequestError::Api(ApiError::BotBlocked))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn flood_waits_are_retried_up_to_the_attempt_limit() {
        let mut calls = 0;
        let result: Result<(), RequestError> = with_telegram_retry("test", || {
            calls += 1;
            async { Err(RequestError::RetryAfter(Seconds::from_seconds(0))) }
        })
        .await;
        assert!(matches!(result, Err(RequestError::RetryAfter(_))));
        assert_eq!(calls, TELEGRAM_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn flood_wait_then_success_returns_value() {
        let mut calls = 0;
        let result = with_telegram_retry("test", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt == 1 {
                    Err(RequestError::RetryAfter(Seconds::from_seconds(0)))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn success_returns_first_value() {
        let mut calls = 0;
        let result = with_telegram_retry("test", || {
            calls += 1;
            async { Ok::<_, RequestError>(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 1);
    }
}
