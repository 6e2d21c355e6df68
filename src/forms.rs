use crate::settings::UserData;
use crate::tracker::{Tracker, TrackingError};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::debug;

/// Fields never copied into an auto-identify payload.
const PRIVATE_FIELDS: [&str; 2] = ["email", "password"];

/// Submitted form values keyed by field name. Repeated fields (checkbox
/// groups) collapse into arrays in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FormSubmission(Map<String, Value>);

impl FormSubmission {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = Map::new();
        for (key, value) in pairs {
            let key = key.into();
            let value = Value::String(value.into());
            match map.get_mut(&key) {
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(key, value);
                }
            }
        }
        Self(map)
    }

    pub fn email(&self) -> Option<&str> {
        self.0
            .get("email")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Identity built from a submitted email, or `None` when there is none.
/// With `capture_all` every other field except email and password is copied
/// into the traits.
pub fn auto_identify_payload(submission: &FormSubmission, capture_all: bool) -> Option<UserData> {
    let email = submission.email()?;
    let mut user = UserData::new(email, email);
    if capture_all {
        for (key, value) in submission.as_map() {
            if !PRIVATE_FIELDS.contains(&key.as_str()) {
                user.insert(key.clone(), value.clone());
            }
        }
    }
    Some(user)
}

/// Interaction state of one form between its first focus and submit.
#[derive(Debug, Clone, Default)]
pub struct FormSession {
    required: BTreeSet<String>,
    started: bool,
    fields_interacted: BTreeSet<String>,
}

impl FormSession {
    pub fn require<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(fields.into_iter().map(Into::into));
    }

    /// Returns true on the first focus of the session; that is when
    /// `form_started` should be tracked.
    pub fn focus(&mut self, field: impl Into<String>) -> bool {
        self.fields_interacted.insert(field.into());
        if self.started {
            return false;
        }
        self.started = true;
        true
    }

    pub fn blur(&mut self, field: impl Into<String>, has_value: bool) {
        if has_value {
            self.fields_interacted.insert(field.into());
        }
    }

    /// Abandoned: started, touched, and some required field still empty.
    pub fn should_abandon(&self, filled: &BTreeSet<String>) -> bool {
        self.started
            && !self.fields_interacted.is_empty()
            && self.required.iter().any(|field| !filled.contains(field))
    }

    pub fn fields_interacted(&self) -> Vec<String> {
        self.fields_interacted.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureOutcome {
    pub form_id: String,
    pub identified: Option<String>,
}

/// Tracks the submission, then identifies the submitter by email when form
/// auto-capture is enabled.
pub async fn capture_submission(
    tracker: &mut Tracker,
    form_id: &str,
    submission: FormSubmission,
) -> Result<CaptureOutcome, TrackingError> {
    tracker
        .track_form_submission(form_id, submission.as_map().clone())
        .await?;

    let settings = tracker.settings().load();
    let identified = if settings.auto_capture_forms {
        match auto_identify_payload(&submission, settings.capture_all_fields) {
            Some(user) => {
                let key = tracker.identify(Some(user)).await?;
                debug!(%form_id, %key, "auto-identified form submitter");
                Some(key)
            }
            None => None,
        }
    } else {
        None
    };

    Ok(CaptureOutcome {
        form_id: form_id.to_string(),
        identified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LoadBehavior, RecordedCall, RecordingLoader, RecordingTrackingClient};
    use crate::settings::SettingsStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn filled(fields: &[&str]) -> BTreeSet<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    async fn ready_tracker(store: SettingsStore) -> (Tracker, Arc<RecordingTrackingClient>) {
        assert!(store.set("writeKey", json!("wk")));
        let client = Arc::new(RecordingTrackingClient::default());
        let loader = Arc::new(RecordingLoader::new(client.clone(), LoadBehavior::Ready));
        let mut tracker = Tracker::new(store, loader, Duration::from_millis(50));
        tracker.initialize().await.unwrap();
        (tracker, client)
    }

    #[test]
    fn repeated_fields_collapse_into_arrays() {
        let submission = FormSubmission::from_pairs([
            ("email", "a@example.com"),
            ("topic", "billing"),
            ("topic", "support"),
            ("topic", "sales"),
        ]);
        assert_eq!(
            Value::Object(submission.as_map().clone()),
            json!({
                "email": "a@example.com",
                "topic": ["billing", "support", "sales"],
            })
        );
        assert_eq!(submission.email(), Some("a@example.com"));
    }

    #[test]
    fn auto_identify_skips_private_fields() {
        let submission = FormSubmission::from_pairs([
            ("email", "a@example.com"),
            ("password", "hunter2"),
            ("company", "Acme"),
        ]);
        let user = auto_identify_payload(&submission, true).unwrap();
        assert_eq!(user.key().as_deref(), Some("a@example.com"));
        assert_eq!(user.get("company"), Some(&json!("Acme")));
        assert_eq!(user.get("password"), None);

        let minimal = auto_identify_payload(&submission, false).unwrap();
        assert_eq!(minimal.get("company"), None);

        let anonymous = FormSubmission::from_pairs([("company", "Acme")]);
        assert!(auto_identify_payload(&anonymous, true).is_none());
    }

    #[test]
    fn session_tracks_start_once() {
        let mut session = FormSession::default();
        session.require(["email"]);
        assert!(session.focus("name"));
        assert!(!session.focus("email"));
        session.blur("phone", false);
        session.blur("message", true);
        assert_eq!(session.fields_interacted(), vec!["email", "message", "name"]);
    }

    #[test]
    fn abandonment_requires_missing_required_field() {
        let mut session = FormSession::default();
        session.require(["email", "name"]);
        assert!(!session.should_abandon(&filled(&[])));

        session.focus("name");
        assert!(session.should_abandon(&filled(&["name"])));
        assert!(!session.should_abandon(&filled(&["name", "email"])));

        let mut optional_only = FormSession::default();
        optional_only.focus("comment");
        assert!(!optional_only.should_abandon(&filled(&[])));
        optional_only.require(["email"]);
        assert!(optional_only.should_abandon(&filled(&[])));
    }

    #[tokio::test]
    async fn capture_submission_identifies_submitter() {
        let (mut tracker, client) = ready_tracker(SettingsStore::in_memory()).await;
        let submission =
            FormSubmission::from_pairs([("email", "lead@example.com"), ("plan", "team")]);
        let outcome = capture_submission(&mut tracker, "lead", submission)
            .await
            .unwrap();
        assert_eq!(outcome.identified.as_deref(), Some("lead@example.com"));
        assert_eq!(
            tracker.status().current_user.as_deref(),
            Some("lead@example.com")
        );

        let calls = client.calls();
        assert!(calls.iter().any(|call| matches!(
            call,
            RecordedCall::Track { event, .. } if event == "form_submitted_lead"
        )));
        assert!(calls.iter().any(|call| matches!(
            call,
            RecordedCall::Identify { traits, .. } if traits.get("plan") == Some(&json!("team"))
        )));
    }

    #[tokio::test]
    async fn capture_submission_respects_auto_capture_flag() {
        let store = SettingsStore::in_memory();
        assert!(store.set("autoCaptureForms", json!(false)));
        let (mut tracker, _) = ready_tracker(store).await;
        let submission = FormSubmission::from_pairs([("email", "lead@example.com")]);
        let outcome = capture_submission(&mut tracker, "lead", submission)
            .await
            .unwrap();
        assert_eq!(outcome.identified, None);
        assert_eq!(tracker.status().current_user, None);
        assert_eq!(tracker.status().event_count, 1);
    }
}
