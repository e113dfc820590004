use std::env;
use std::path::PathBuf;

use anyhow::Result;
use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub database_url: String,
    pub kie_api_key: String,
    pub kie_api_base_url: String,
    pub webhook_url: String,
    pub callback_secret: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    pub admin_user_ids: Vec<i64>,
    pub rate_limit_seconds: u64,
    pub generation_cost: i64,
    pub credit_price_stars: u32,
    pub credit_packs: Vec<u32>,
    pub generation_timeout_minutes: u64,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub http_timeout_seconds: u64,
    pub telegram_max_video_bytes: u64,
    pub veo_aspect_ratio: String,
    pub kling_duration: String,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_i64_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter_map(|value| match value.parse::<i64>() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!("Ignoring invalid id '{}' in id list", value);
                None
            }
        })
        .collect()
}

fn parse_credit_packs(raw: &str) -> Vec<u32> {
    let mut packs = raw
        .split(',')
        .filter_map(|value| value.trim().parse::<u32>().ok())
        .filter(|value| *value > 0)
        .collect::<Vec<_>>();
    packs.sort_unstable();
    packs.dedup();
    if packs.is_empty() {
        packs.push(1);
    }
    packs
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

fn normalize_base_url(value: String) -> String {
    value.trim().trim_end_matches('/').to_string()
}

fn optional_secret(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let server_port = env::var("SERVER_PORT")
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .unwrap_or(5000);

        let generation_cost = env_i64("GENERATION_COST", 1);
        if generation_cost < 1 {
            return Err(anyhow::anyhow!("GENERATION_COST must be at least 1"));
        }

        let credit_price_stars = u32::try_from(env_u64("CREDIT_PRICE_STARS", 100))
            .unwrap_or(100)
            .max(1);

        Ok(Config {
            bot_token: env_string("BOT_TOKEN", ""),
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://video_bot.db?mode=rwc",
            )),
            kie_api_key: env_string("KIE_AI_API_KEY", ""),
            kie_api_base_url: normalize_base_url(env_string(
                "KIE_API_BASE_URL",
                "https://api.kie.ai",
            )),
            webhook_url: normalize_base_url(env_string("WEBHOOK_URL", "http://localhost:5000")),
            callback_secret: optional_secret(env_string("CALLBACK_SECRET", "")),
            server_host: env_string("SERVER_HOST", "0.0.0.0"),
            server_port,
            admin_user_ids: parse_i64_list(&env_string("ADMIN_USER_IDS", "")),
            rate_limit_seconds: env_u64("RATE_LIMIT_SECONDS", 5),
            generation_cost,
            credit_price_stars,
            credit_packs: parse_credit_packs(&env_string("CREDIT_PACKS", "1,5,10")),
            generation_timeout_minutes: env_u64("GENERATION_TIMEOUT_MINUTES", 120),
            upload_dir: PathBuf::from(env_string("UPLOAD_DIR", "uploads")),
            max_upload_bytes: env_u64("MAX_UPLOAD_BYTES", 10 * 1024 * 1024) as usize,
            http_timeout_seconds: env_u64("HTTP_TIMEOUT_SECONDS", 60).max(1),
            telegram_max_video_bytes: env_u64("TELEGRAM_MAX_VIDEO_BYTES", 50 * 1024 * 1024),
            veo_aspect_ratio: env_string("VEO_ASPECT_RATIO", "16:9"),
            kling_duration: env_string("KLING_DURATION", "5"),
        })
    }

    pub fn callback_url(&self) -> String {
        format!("{}/kie_callback", self.webhook_url)
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }

    pub fn pack_price(&self, credits: u32) -> u32 {
        credits.saturating_mul(self.credit_price_stars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_list_skips_blank_and_invalid_entries() {
        assert_eq!(parse_i64_list(" 42, ,abc,-7"), vec![42, -7]);
        assert!(parse_i64_list("").is_empty());
    }

    #[test]
    fn credit_packs_are_sorted_and_never_empty() {
        assert_eq!(parse_credit_packs("10,1,5,5,0"), vec![1, 5, 10]);
        assert_eq!(parse_credit_packs("nope"), vec![1]);
    }

    #[test]
    fn database_url_drops_python_driver_prefix() {
        assert_eq!(
            normalize_database_url("sqlite+aiosqlite:///bot.db".to_string()),
            "sqlite:///bot.db"
        );
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        assert_eq!(
            normalize_base_url(" https://example.org/ ".to_string()),
            "https://example.org"
        );
    }
}
