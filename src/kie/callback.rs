//! Normalizes the provider's callback bodies.
//!
//! KIE.ai posts different shapes depending on which endpoint created the
//! task. Veo tasks report `code` plus `data.info.resultUrls`; market jobs
//! (Kling) report `data.state` with a JSON-encoded `data.resultJson`. The
//! older flat `{generation_id, status, video_url}` shape is still accepted.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Completed { video_url: String },
    Failed { reason: Option<String> },
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub task_id: String,
    pub outcome: CallbackOutcome,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackParseError {
    #[error("callback body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("callback does not identify a task")]
    MissingTaskId,
}

pub fn parse_callback(body: &[u8]) -> Result<CallbackEvent, CallbackParseError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| CallbackParseError::InvalidJson(err.to_string()))?;

    if value.get("generation_id").is_some() {
        return parse_flat(&value);
    }

    let data = value.get("data").unwrap_or(&Value::Null);
    let task_id = non_empty_str(data.get("taskId"))
        .or_else(|| non_empty_str(value.get("taskId")))
        .ok_or(CallbackParseError::MissingTaskId)?;

    let outcome = if data.get("state").is_some() {
        job_outcome(data)
    } else {
        veo_outcome(&value, data)
    };

    Ok(CallbackEvent { task_id, outcome })
}

fn parse_flat(value: &Value) -> Result<CallbackEvent, CallbackParseError> {
    let task_id =
        non_empty_str(value.get("generation_id")).ok_or(CallbackParseError::MissingTaskId)?;
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();

    let outcome = match status.as_str() {
        "completed" | "success" => match non_empty_str(value.get("video_url")) {
            Some(video_url) => CallbackOutcome::Completed { video_url },
            None => missing_video_url(),
        },
        "failed" | "fail" | "error" => CallbackOutcome::Failed {
            reason: non_empty_str(value.get("error")),
        },
        _ => CallbackOutcome::InProgress,
    };
    Ok(CallbackEvent { task_id, outcome })
}

fn job_outcome(data: &Value) -> CallbackOutcome {
    let state = data
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();

    match state.as_str() {
        "success" => {
            let urls = match data.get("resultJson") {
                Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
                    .map(|parsed| result_urls(parsed.get("resultUrls")))
                    .unwrap_or_default(),
                Some(other) => result_urls(other.get("resultUrls")),
                None => Vec::new(),
            };
            first_url_or_failure(urls)
        }
        "fail" | "failed" => CallbackOutcome::Failed {
            reason: non_empty_str(data.get("failMsg"))
                .or_else(|| non_empty_str(data.get("failCode"))),
        },
        _ => CallbackOutcome::InProgress,
    }
}

fn veo_outcome(value: &Value, data: &Value) -> CallbackOutcome {
    let code = value.get("code").and_then(Value::as_i64).unwrap_or(200);
    if code != 200 {
        return CallbackOutcome::Failed {
            reason: non_empty_str(value.get("msg")),
        };
    }

    let urls = data
        .get("info")
        .map(|info| result_urls(info.get("resultUrls")))
        .unwrap_or_default();
    first_url_or_failure(urls)
}

fn first_url_or_failure(urls: Vec<String>) -> CallbackOutcome {
    match urls.into_iter().next() {
        Some(video_url) => CallbackOutcome::Completed { video_url },
        None => missing_video_url(),
    }
}

fn missing_video_url() -> CallbackOutcome {
    CallbackOutcome::Failed {
        reason: Some("provider reported success without a video url".to_string()),
    }
}

/// `resultUrls` arrives either as an array or as a JSON-encoded array string.
fn result_urls(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Array(_)) => result_urls(Some(&parsed)),
            _ if raw.trim().starts_with("http") => vec![raw.trim().to_string()],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    let value = value?;
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<CallbackEvent, CallbackParseError> {
        parse_callback(body.as_bytes())
    }

    #[test]
    fn veo_success_with_array_urls() {
        let event = parse(
            r#"{"code":200,"msg":"Veo3 video generated successfully.",
                "data":{"taskId":"veo_1","info":{"resultUrls":["https://cdn.example/v.mp4"]}}}"#,
        )
        .unwrap();
        assert_eq!(event.task_id, "veo_1");
        assert_eq!(
            event.outcome,
            CallbackOutcome::Completed {
                video_url: "https://cdn.example/v.mp4".to_string()
            }
        );
    }

    #[test]
    fn veo_success_with_encoded_urls() {
        let event = parse(
            r#"{"code":200,"data":{"taskId":"veo_2","info":{"resultUrls":"[\"https://cdn.example/w.mp4\"]"}}}"#,
        )
        .unwrap();
        assert_eq!(
            event.outcome,
            CallbackOutcome::Completed {
                video_url: "https://cdn.example/w.mp4".to_string()
            }
        );
    }

    #[test]
    fn veo_error_code_is_failure() {
        let event = parse(
            r#"{"code":501,"msg":"Content policy violation","data":{"taskId":"veo_3"}}"#,
        )
        .unwrap();
        assert_eq!(
            event.outcome,
            CallbackOutcome::Failed {
                reason: Some("Content policy violation".to_string())
            }
        );
    }

    #[test]
    fn job_states_map_to_outcomes() {
        let success = parse(
            r#"{"code":200,"data":{"taskId":"k1","state":"success",
                "resultJson":"{\"resultUrls\":[\"https://cdn.example/k.mp4\"]}"}}"#,
        )
        .unwrap();
        assert_eq!(
            success.outcome,
            CallbackOutcome::Completed {
                video_url: "https://cdn.example/k.mp4".to_string()
            }
        );

        let failed = parse(
            r#"{"code":501,"data":{"taskId":"k2","state":"fail","failMsg":"image rejected"}}"#,
        )
        .unwrap();
        assert_eq!(
            failed.outcome,
            CallbackOutcome::Failed {
                reason: Some("image rejected".to_string())
            }
        );

        let running = parse(r#"{"code":200,"data":{"taskId":"k3","state":"generating"}}"#).unwrap();
        assert_eq!(running.outcome, CallbackOutcome::InProgress);
    }

    #[test]
    fn flat_shape_is_still_accepted() {
        let done = parse(
            r#"{"generation_id":"g1","status":"completed","video_url":"https://cdn.example/g.mp4"}"#,
        )
        .unwrap();
        assert_eq!(done.task_id, "g1");
        assert!(matches!(done.outcome, CallbackOutcome::Completed { .. }));

        let failed = parse(r#"{"generation_id":"g2","status":"failed"}"#).unwrap();
        assert_eq!(failed.outcome, CallbackOutcome::Failed { reason: None });
    }

    #[test]
    fn success_without_url_becomes_failure() {
        let event = parse(r#"{"generation_id":"g3","status":"completed"}"#).unwrap();
        assert!(matches!(event.outcome, CallbackOutcome::Failed { reason: Some(_) }));

        let event = parse(r#"{"code":200,"data":{"taskId":"veo_4","info":{}}}"#).unwrap();
        assert!(matches!(event.outcome, CallbackOutcome::Failed { reason: Some(_) }));
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(matches!(parse("not json"), Err(CallbackParseError::InvalidJson(_))));
        assert_eq!(parse(r#"{"code":200,"data":{}}"#), Err(CallbackParseError::MissingTaskId));
        assert_eq!(
            parse(r#"{"generation_id":"","status":"completed"}"#),
            Err(CallbackParseError::MissingTaskId)
        );
    }
}
