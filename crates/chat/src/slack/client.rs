//! Slack Web API HTTP client
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Every method is a
//! single request; retrying is the caller's business.

use std::time::Duration;

use serde_json::Value;

use super::api::{FilesQuery, HistoryPage, ListPage};
use super::{ApiError, HISTORY_PAGE_LIMIT, SlackApi};
use crate::models::{ConversationType, EntityKind, Ts};

/// Whether `url` points at Slack's own hosts
///
/// Only these URLs may carry the workspace credential.
pub fn is_slack_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    ["slack.com", "slack-edge.com", "slack-files.com"]
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
}

/// Blocking Slack Web API client
pub struct SlackClient {
    token: String,
    agent: ureq::Agent,
    base_url: String,
}

impl SlackClient {
    /// Slack Web API base URL
    const BASE_URL: &'static str = "https://slack.com/api";

    /// Per-request timeout
    const TIMEOUT: Duration = Duration::from_secs(60);

    /// Retry-after used when a rate-limit answer carries no hint
    const DEFAULT_RETRY_AFTER: u64 = 30;

    /// History pages of 1000 messages can be large
    const MAX_RESPONSE_BYTES: u64 = 256 * 1024 * 1024;

    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, Self::BASE_URL)
    }

    /// Point the client at another server (a proxy or a test double)
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Self::TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            token: token.into(),
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Call a read method with query parameters
    fn get(&self, method: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.base_url, method);
        let mut request = self
            .agent
            .get(&url)
            .header("Authorization", &format!("Bearer {}", self.token));
        for (key, value) in params {
            request = request.query(*key, value);
        }

        let response = request.call().map_err(|e| transport_error(method, e))?;
        self.decode(method, response)
    }

    /// Call a write method with a form body
    fn post(&self, method: &str, form: &[(&str, &str)]) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .agent
            .post(&url)
            .header("Authorization", &format!("Bearer {}", self.token))
            .send_form(form.iter().copied())
            .map_err(|e| transport_error(method, e))?;
        self.decode(method, response)
    }

    fn decode(
        &self,
        method: &str,
        mut response: ureq::http::Response<ureq::Body>,
    ) -> Result<Value, ApiError> {
        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(Self::DEFAULT_RETRY_AFTER);
            return Err(ApiError::rate_limited(method, retry_after));
        }
        if !(200..300).contains(&status) {
            return Err(ApiError::Http {
                method: method.to_string(),
                status,
            });
        }

        let body: Value = response
            .body_mut()
            .with_config()
            .limit(Self::MAX_RESPONSE_BYTES)
            .read_json()
            .map_err(|e| match transport_error(method, e) {
                ApiError::Network { method, message } => ApiError::Network { method, message },
                other => ApiError::Decode {
                    method: method.to_string(),
                    message: other.to_string(),
                },
            })?;

        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body);
        }

        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        if error == "ratelimited" {
            return Err(ApiError::rate_limited(method, Self::DEFAULT_RETRY_AFTER));
        }
        Err(ApiError::api(method, error))
    }

    fn history_params(channel: &str, oldest: &Ts, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("channel", channel.to_string()),
            ("oldest", oldest.to_string()),
            ("limit", HISTORY_PAGE_LIMIT.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        params
    }
}

impl SlackApi for SlackClient {
    fn history(&self, channel: &str, oldest: &Ts, cursor: Option<&str>) -> Result<HistoryPage, ApiError> {
        let method = "conversations.history";
        let body = self.get(method, &Self::history_params(channel, oldest, cursor))?;
        parse_page(method, body)
    }

    fn replies(
        &self,
        channel: &str,
        thread_ts: &Ts,
        oldest: &Ts,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, ApiError> {
        let method = "conversations.replies";
        let mut params = Self::history_params(channel, oldest, cursor);
        params.push(("ts", thread_ts.to_string()));
        let body = self.get(method, &params)?;
        parse_page(method, body)
    }

    fn list(
        &self,
        kind: EntityKind,
        types: &[ConversationType],
        cursor: Option<&str>,
    ) -> Result<ListPage, ApiError> {
        let method = kind.endpoint();
        let mut params = Vec::new();
        if kind == EntityKind::Conversations {
            params.push(("types", ConversationType::join(types)));
        }
        if kind.is_cursor_paginated() {
            params.push(("limit", "1000".to_string()));
            if let Some(cursor) = cursor {
                params.push(("cursor", cursor.to_string()));
            }
        }

        let mut body = self.get(method, &params)?;
        let items = body
            .get_mut(kind.response_field())
            .map(Value::take)
            .ok_or_else(|| ApiError::Decode {
                method: method.to_string(),
                message: format!("missing field `{}`", kind.response_field()),
            })?;
        let next_cursor = body
            .pointer("/response_metadata/next_cursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        Ok(ListPage { items, next_cursor })
    }

    fn list_files(&self, query: &FilesQuery) -> Result<Vec<Value>, ApiError> {
        let method = EntityKind::Files.endpoint();
        let mut params = vec![("count", query.count.to_string())];
        if let Some(ts_from) = query.ts_from {
            params.push(("ts_from", ts_from.to_string()));
        }
        if let Some(ts_to) = query.ts_to {
            params.push(("ts_to", ts_to.to_string()));
        }

        let mut body = self.get(method, &params)?;
        match body.get_mut("files").map(Value::take) {
            Some(Value::Array(files)) => Ok(files),
            _ => Err(ApiError::Decode {
                method: method.to_string(),
                message: "missing field `files`".to_string(),
            }),
        }
    }

    fn delete_file(&self, file_id: &str) -> Result<(), ApiError> {
        self.post("files.delete", &[("file", file_id)]).map(|_| ())
    }

    fn join_channel(&self, channel: &str) -> Result<(), ApiError> {
        self.post("conversations.join", &[("channel", channel)]).map(|_| ())
    }

    fn is_bot_token(&self) -> bool {
        self.token.starts_with("xoxb-")
    }
}

fn parse_page(method: &str, body: Value) -> Result<HistoryPage, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::Decode {
        method: method.to_string(),
        message: e.to_string(),
    })
}

/// Classify a transport-level failure
fn transport_error(method: &str, err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::Timeout(_)
        | ureq::Error::Io(_)
        | ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound => ApiError::network(method, err.to_string()),
        ureq::Error::StatusCode(429) => ApiError::rate_limited(method, SlackClient::DEFAULT_RETRY_AFTER),
        ureq::Error::StatusCode(status) => ApiError::Http {
            method: method.to_string(),
            status,
        },
        other => ApiError::Decode {
            method: method.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_slack_url() {
        assert!(is_slack_url("https://files.slack.com/files-pri/T1-F1/a.png"));
        assert!(is_slack_url("https://a.slack-edge.com/80588/img/emoji.png"));
        assert!(is_slack_url("https://slack-files.com/T1-F1-abc"));
        assert!(is_slack_url("https://slack.com/api/files.list"));
        assert!(!is_slack_url("https://example.com/image.png"));
        assert!(!is_slack_url("https://notslack.com/a"));
        assert!(!is_slack_url("https://evil.com/files.slack.com/x"));
        assert!(!is_slack_url("not a url"));
    }

    #[test]
    fn test_bot_token() {
        assert!(SlackClient::new("xoxb-123").is_bot_token());
        assert!(!SlackClient::new("xoxp-123").is_bot_token());
    }

    #[test]
    fn test_history_params() {
        let params = SlackClient::history_params("C1", &Ts::start(), Some("dXNlcjpVMDYxTkZUVDI="));
        assert_eq!(
            params,
            vec![
                ("channel", "C1".to_string()),
                ("oldest", "1".to_string()),
                ("limit", "1000".to_string()),
                ("cursor", "dXNlcjpVMDYxTkZUVDI=".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_page() {
        let body = serde_json::json!({
            "ok": true,
            "messages": [{"ts": "1.0", "text": "hi"}],
            "has_more": true,
            "response_metadata": {"next_cursor": "abc"}
        });
        let page = parse_page("conversations.history", body).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(page.has_more);
        assert_eq!(page.next_cursor(), Some("abc"));
    }

    #[test]
    fn test_empty_cursor_is_none() {
        let body = serde_json::json!({"ok": true, "messages": [], "response_metadata": {"next_cursor": ""}});
        let page = parse_page("conversations.history", body).unwrap();
        assert_eq!(page.next_cursor(), None);
        assert!(!page.has_more);
    }
}
