//! Deploy notifications: email (local `sendmail`) and Slack webhooks.
//!
//! Delivery is best-effort. [`dispatch`] logs every failure and never
//! returns an error.

use rand::seq::SliceRandom;
use reqwest::blocking::Client;
use serde_json::json;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::{EmailConfig, SlackConfig};
use crate::error::{Error, Result};

pub const SLACK_COLOR: &str = "#B8CB82";
pub const SUBJECT_PREFIX: &str = "WebHook";
const FALLBACK_MESSAGE: &str = "New release";

/// What happened, addressed to whoever the repository config names.
#[derive(Debug, Clone, Default)]
pub struct Notification {
    pub subject: String,
    /// Deploy transcript.
    pub body: String,
    pub emails: Vec<String>,
    pub slack: Option<SlackConfig>,
    pub release_name: Option<String>,
    pub live_url: Option<String>,
    pub last_commit: Option<String>,
}

impl Notification {
    pub fn subject_for(release_name: Option<&str>) -> String {
        match release_name {
            Some(name) if !name.is_empty() => format!("{} {}", SUBJECT_PREFIX, name),
            _ => SUBJECT_PREFIX.to_string(),
        }
    }
}

pub trait Notifier {
    fn name(&self) -> &'static str;

    /// Deliver `notification`. Returns `Ok(false)` when it does not apply to
    /// this channel.
    fn notify(&self, notification: &Notification) -> Result<bool>;
}

/// Send through every notifier, logging failures.
pub fn dispatch(notifiers: &[Box<dyn Notifier>], notification: &Notification) -> Vec<&'static str> {
    let mut delivered = Vec::new();
    for notifier in notifiers {
        match notifier.notify(notification) {
            Ok(true) => delivered.push(notifier.name()),
            Ok(false) => {}
            Err(e) => log_status!("notify", "{} notification failed: {}", notifier.name(), e.describe()),
        }
    }
    delivered
}

// ============================================================================
// Email
// ============================================================================

pub struct SendmailNotifier {
    program: String,
    sender: Option<String>,
    address: Option<String>,
}

impl SendmailNotifier {
    pub fn new(config: &EmailConfig) -> Self {
        Self {
            program: "sendmail".to_string(),
            sender: config.sender.clone(),
            address: config.address.clone(),
        }
    }

    /// Use another sendmail-compatible binary (must accept `-t`).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn from_header(&self) -> Option<String> {
        let address = self.address.as_deref().filter(|a| !a.is_empty())?;
        Some(match self.sender.as_deref().filter(|s| !s.is_empty()) {
            Some(sender) => format!("{} <{}>", sender, address),
            None => address.to_string(),
        })
    }
}

/// RFC 5322 message for `sendmail -t`.
pub fn compose_email(from: Option<&str>, notification: &Notification) -> String {
    let mut message = String::new();
    if let Some(from) = from {
        message.push_str(&format!("From: {}\n", from));
    }
    message.push_str(&format!("To: {}\n", notification.emails.join(", ")));
    message.push_str(&format!("Subject: {}\n", notification.subject));
    message.push_str("Content-Type: text/plain; charset=UTF-8\n\n");
    message.push_str(&notification.body);
    message.push('\n');
    message
}

impl Notifier for SendmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    fn notify(&self, notification: &Notification) -> Result<bool> {
        if notification.emails.is_empty() {
            return Ok(false);
        }

        let message = compose_email(self.from_header().as_deref(), notification);

        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::external_service("sendmail", e.to_string(), None))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .map_err(|e| Error::external_service("sendmail", e.to_string(), None))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Error::external_service("sendmail", e.to_string(), None))?;
        if !output.status.success() {
            return Err(Error::external_service(
                "sendmail",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                None,
            ));
        }
        Ok(true)
    }
}

// ============================================================================
// Slack
// ============================================================================

pub struct SlackNotifier {
    client: Client,
    messages: Vec<String>,
}

impl SlackNotifier {
    pub fn new(messages: &[String]) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;

        Ok(Self {
            client,
            messages: messages.to_vec(),
        })
    }

    fn random_message(&self) -> &str {
        self.messages
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(FALLBACK_MESSAGE)
    }
}

/// Headline for a release announcement, or `None` when there is neither a
/// URL nor a name to announce.
pub fn slack_pretext(message: &str, live_url: Option<&str>, name: Option<&str>) -> Option<String> {
    let live_url = live_url.filter(|u| !u.is_empty());
    let name = name.filter(|n| !n.is_empty());

    match (live_url, name) {
        (Some(url), Some(name)) => Some(format!("{}: <{}|{}>", message, url, name)),
        (Some(url), None) => Some(format!("{}: <{}>", message, url)),
        (None, Some(name)) => Some(format!("{}: {}", message, name)),
        (None, None) => None,
    }
}

pub fn slack_payload(channel: &str, pretext: &str, last_commit: &str) -> serde_json::Value {
    json!({
        "channel": channel,
        "pretext": pretext,
        "fallback": pretext,
        "color": SLACK_COLOR,
        "fields": [
            {
                "title": "Release",
                "value": format!("Last commit: {}", last_commit),
                "short": false,
            }
        ],
    })
}

impl Notifier for SlackNotifier {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn notify(&self, notification: &Notification) -> Result<bool> {
        let Some((url, channel)) = notification.slack.as_ref().and_then(SlackConfig::target) else {
            return Ok(false);
        };
        let Some(pretext) = slack_pretext(
            self.random_message(),
            notification.live_url.as_deref(),
            notification.release_name.as_deref(),
        ) else {
            return Ok(false);
        };

        let payload = slack_payload(
            channel,
            &pretext,
            notification.last_commit.as_deref().unwrap_or_default(),
        );

        let response = self
            .client
            .post(url)
            .form(&[("payload", payload.to_string())])
            .send()
            .map_err(|e| Error::external_service("Slack", e.to_string(), None))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::external_service(
                "Slack",
                format!("HTTP {}", status.as_u16()),
                Some(status.as_u16()),
            ));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recording {
        seen: RefCell<Vec<String>>,
        fail: bool,
    }

    impl Notifier for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn notify(&self, notification: &Notification) -> Result<bool> {
            self.seen.borrow_mut().push(notification.subject.clone());
            if self.fail {
                Err(Error::external_service("test", "down", None))
            } else {
                Ok(true)
            }
        }
    }

    #[test]
    fn pretext_variants() {
        assert_eq!(
            slack_pretext("Shipped", Some("https://app.example.com"), Some("App")).as_deref(),
            Some("Shipped: <https://app.example.com|App>")
        );
        assert_eq!(
            slack_pretext("Shipped", Some("https://app.example.com"), None).as_deref(),
            Some("Shipped: <https://app.example.com>")
        );
        assert_eq!(
            slack_pretext("Shipped", Some(""), Some("App")).as_deref(),
            Some("Shipped: App")
        );
        assert_eq!(slack_pretext("Shipped", None, Some("")), None);
    }

    #[test]
    fn payload_carries_colour_and_last_commit() {
        let payload = slack_payload("#deploys", "Shipped: App", "Fix login");
        assert_eq!(payload["channel"], "#deploys");
        assert_eq!(payload["color"], SLACK_COLOR);
        assert_eq!(payload["fields"][0]["value"], "Last commit: Fix login");
    }

    #[test]
    fn email_has_headers_and_transcript() {
        let notification = Notification {
            subject: Notification::subject_for(Some("App")),
            body: "~> make build".to_string(),
            emails: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            ..Notification::default()
        };

        let message = compose_email(Some("Deploy Bot <bot@example.com>"), &notification);

        assert!(message.starts_with("From: Deploy Bot <bot@example.com>\n"));
        assert!(message.contains("To: a@example.com, b@example.com\n"));
        assert!(message.contains("Subject: WebHook App\n"));
        assert!(message.ends_with("\n\n~> make build\n"));
    }

    #[test]
    fn email_is_skipped_without_recipients() {
        let notifier = SendmailNotifier::new(&EmailConfig::default()).with_program("/nonexistent/sendmail");
        assert!(!notifier.notify(&Notification::default()).unwrap());
    }

    #[test]
    fn email_pipes_message_into_program() {
        let notifier = SendmailNotifier::new(&EmailConfig::default()).with_program("cat");
        let notification = Notification {
            subject: "WebHook App".to_string(),
            emails: vec!["a@example.com".to_string()],
            ..Notification::default()
        };
        assert!(notifier.notify(&notification).unwrap());
    }

    #[test]
    fn slack_is_skipped_without_target() {
        let notifier = SlackNotifier::new(&["Shipped".to_string()]).unwrap();
        let notification = Notification {
            slack: Some(SlackConfig {
                url: Some("https://hooks.slack.com/x".to_string()),
                channel: None,
            }),
            live_url: Some("https://app.example.com".to_string()),
            ..Notification::default()
        };
        assert!(!notifier.notify(&notification).unwrap());
    }

    #[test]
    fn dispatch_continues_past_failures() {
        let failing = Recording { seen: RefCell::new(Vec::new()), fail: true };
        let notifiers: Vec<Box<dyn Notifier>> = vec![
            Box::new(failing),
            Box::new(Recording { seen: RefCell::new(Vec::new()), fail: false }),
        ];
        let notification = Notification {
            subject: "WebHook App".to_string(),
            ..Notification::default()
        };

        assert_eq!(dispatch(&notifiers, &notification), vec!["recording"]);
    }

    #[test]
    fn subject_without_name() {
        assert_eq!(Notification::subject_for(None), "WebHook");
    }
}
