//! Outbound calls: the frontend notifier and downstream consumers.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use coursebuild_core::{CourseKey, Settings, VersionId};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// `{success, errors}` as answered by the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotifyResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

fn default_success() -> bool {
    true
}

/// The frontend serving the course.
pub trait Notifier: Send + Sync {
    /// Tell the frontend that a new version of course `remote_id` is ready.
    fn notify_update(&self, remote_id: u64, email_on_error: bool)
        -> Result<NotifyResponse, String>;

    /// Ask the frontend to mail the course staff.
    fn send_error_mail(&self, remote_id: u64, subject: &str, message: &str) -> Result<(), String>;
}

/// Consumers listed under a course's `configures`.
pub trait Downstream: Send + Sync {
    /// Instruct the consumer at `url` to adopt `version`.
    fn publish(&self, url: &str, course: &CourseKey, version: &VersionId) -> Result<(), String>;
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build()
}

fn describe(error: ureq::Error) -> String {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            format!("HTTP {code}: {}", body.trim())
        }
        ureq::Error::Transport(t) => t.to_string(),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpNotifier {
    base_url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpNotifier {
    /// `None` when no `frontend_url` is configured.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let base_url = settings.frontend_url.as_deref()?.trim_end_matches('/');
        Some(Self {
            base_url: base_url.to_string(),
            token: settings.frontend_token.clone(),
            agent: agent(),
        })
    }

    fn post(&self, path: &str, body: serde_json::Value) -> Result<ureq::Response, String> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self.agent.post(&url);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Token {token}"));
        }
        request.send_json(body).map_err(describe)
    }
}

impl Notifier for HttpNotifier {
    fn notify_update(
        &self,
        remote_id: u64,
        email_on_error: bool,
    ) -> Result<NotifyResponse, String> {
        let response = self.post(
            &format!("api/v2/courses/{remote_id}/notify_update/"),
            json!({ "email_on_error": email_on_error }),
        )?;
        response
            .into_json::<NotifyResponse>()
            .map_err(|e| format!("malformed notify response: {e}"))
    }

    fn send_error_mail(&self, remote_id: u64, subject: &str, message: &str) -> Result<(), String> {
        self.post(
            &format!("api/v2/courses/{remote_id}/send_mail/"),
            json!({ "subject": subject, "message": message }),
        )
        .map(|_| ())
    }
}

/// POSTs `{course_key, version_id}` to each consumer URL.
#[derive(Debug, Clone)]
pub struct HttpDownstream {
    agent: ureq::Agent,
}

impl Default for HttpDownstream {
    fn default() -> Self {
        Self { agent: agent() }
    }
}

impl Downstream for HttpDownstream {
    fn publish(&self, url: &str, course: &CourseKey, version: &VersionId) -> Result<(), String> {
        self.agent
            .post(url)
            .send_json(json!({
                "course_key": course.as_str(),
                "version_id": version.as_str(),
            }))
            .map(|_| ())
            .map_err(describe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_needs_frontend_url() {
        let mut settings = Settings::default();
        assert!(HttpNotifier::from_settings(&settings).is_none());
        settings.frontend_url = Some("https://plus.example.org/".to_string());
        let notifier = HttpNotifier::from_settings(&settings).expect("configured");
        assert_eq!(notifier.base_url, "https://plus.example.org");
    }

    #[test]
    fn response_errors_default_to_empty() {
        let response: NotifyResponse =
            serde_json::from_str(r#"{"success": true}"#).expect("parse");
        assert_eq!(response, NotifyResponse { success: true, errors: vec![] });
    }

    #[test]
    fn missing_success_counts_as_success() {
        let response: NotifyResponse =
            serde_json::from_str(r#"{"errors": ["stale cache"]}"#).expect("parse");
        assert!(response.success);
        assert_eq!(response.errors, vec!["stale cache".to_string()]);
    }

    #[test]
    fn unreachable_consumer_reports_error() {
        let downstream = HttpDownstream::default();
        let result = downstream.publish(
            "http://127.0.0.1:9/configure",
            &CourseKey::from("c"),
            &VersionId::from("v"),
        );
        assert!(result.is_err());
    }
}
