use crate::client::{ClientError, ClientLoader, LoadOptions, TrackingClient};
use crate::settings::{SettingsStore, UserData, now_rfc3339};
use chrono::{Local, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("write key is required to initialize the tracking client")]
    MissingWriteKey,
    #[error("tracking client not loaded")]
    ClientMissing,
    #[error("no anonymous user to convert")]
    NoAnonymousUser,
    #[error("user data needs an id or email to identify")]
    MissingIdentity,
    #[error("tracking client not ready after {0:?}")]
    LoadTimeout(Duration),
    #[error(transparent)]
    Load(ClientError),
    #[error("tracking call failed: {0}")]
    Delegate(ClientError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

/// Per-process session counters. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub phase: SessionPhase,
    pub initialized: bool,
    pub current_user: Option<String>,
    pub anonymous_id: Option<String>,
    pub event_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatus {
    pub initialized: bool,
    pub current_user: Option<String>,
    pub anonymous_id: Option<String>,
    pub event_count: u64,
    pub sdk_loaded: bool,
    pub phase: SessionPhase,
}

/// Broadcast on every successful tracker action.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerEvent {
    pub time: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

/// Turns stored settings into calls against the loaded tracking client.
///
/// One instance per runtime context; it owns the session state and the
/// client, and every call that needs the client fails with
/// [`TrackingError::ClientMissing`] while none is loaded. Calls are never
/// queued or retried.
pub struct Tracker {
    store: SettingsStore,
    loader: Arc<dyn ClientLoader>,
    client: Option<Arc<dyn TrackingClient>>,
    session: SessionState,
    location: String,
    ready_timeout: Duration,
    events: broadcast::Sender<TrackerEvent>,
}

impl Tracker {
    pub fn new(store: SettingsStore, loader: Arc<dyn ClientLoader>, ready_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            loader,
            client: None,
            session: SessionState::default(),
            location: "/".to_string(),
            ready_timeout,
            events,
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.store
    }

    pub fn event_sender(&self) -> broadcast::Sender<TrackerEvent> {
        self.events.clone()
    }

    #[allow(dead_code)]
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Sets the path `page` falls back to when called without a name.
    pub fn navigate(&mut self, path: impl Into<String>) {
        self.location = path.into();
    }

    /// Drops any loaded client and loads a fresh one from the stored write
    /// key. Ready once the loader completes; gives up after the ready
    /// timeout and leaves the session uninitialized.
    pub async fn initialize(&mut self) -> Result<(), TrackingError> {
        let sdk = self.store.sdk_config();
        if sdk.write_key.trim().is_empty() {
            error!("write key is required to initialize the tracking client");
            return Err(TrackingError::MissingWriteKey);
        }

        if self.client.take().is_some() {
            debug!("dropping previously loaded tracking client");
        }
        // Identity belonged to the dropped client.
        self.session.current_user = None;
        self.session.anonymous_id = None;
        self.session.phase = SessionPhase::Initializing;
        self.session.initialized = false;

        let options = LoadOptions::new(sdk.write_key.clone())
            .with_anonymous_in_app(sdk.enable_anonymous_in_app);
        let loaded = tokio::time::timeout(self.ready_timeout, self.loader.load(options)).await;
        let client = match loaded {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                self.session.phase = SessionPhase::Uninitialized;
                warn!(?err, "tracking client failed to load");
                return Err(TrackingError::Load(err));
            }
            Err(_) => {
                self.session.phase = SessionPhase::Uninitialized;
                warn!(timeout = ?self.ready_timeout, "tracking client did not become ready");
                return Err(TrackingError::LoadTimeout(self.ready_timeout));
            }
        };

        // The vendor snippet records a page view as soon as it loads.
        if let Err(err) = client.page(&self.location, Map::new()).await {
            warn!(?err, "initial page view failed");
        }
        self.client = Some(client);

        if sdk.enable_anonymous {
            self.setup_anonymous_tracking().await;
        }

        self.session.phase = SessionPhase::Ready;
        self.session.initialized = true;
        self.emit(
            "SDK Initialized",
            json!({ "writeKey": mask_write_key(&sdk.write_key) }),
        );
        Ok(())
    }

    async fn setup_anonymous_tracking(&mut self) {
        let stored = self.store.load().anonymous_id;
        let anonymous_id = if stored.is_empty() {
            generate_anonymous_id()
        } else {
            stored
        };
        self.session.anonymous_id = Some(anonymous_id.clone());

        let Some(client) = self.client.clone() else {
            return;
        };
        match client.set_anonymous_id(&anonymous_id).await {
            Ok(()) => self.emit(
                "Anonymous Tracking Enabled",
                json!({ "anonymousId": anonymous_id }),
            ),
            Err(err) => warn!(?err, %anonymous_id, "failed to set anonymous id"),
        }
    }

    fn require_client(&self, operation: &str) -> Result<Arc<dyn TrackingClient>, TrackingError> {
        self.client.clone().ok_or_else(|| {
            error!(%operation, "tracking client not loaded");
            TrackingError::ClientMissing
        })
    }

    fn delegate_failure(operation: &str, err: ClientError) -> TrackingError {
        error!(%operation, ?err, "tracking call failed");
        TrackingError::Delegate(err)
    }

    fn identity_key(data: &UserData, operation: &str) -> Result<String, TrackingError> {
        data.key().ok_or_else(|| {
            error!(%operation, "user data has neither id nor email");
            TrackingError::MissingIdentity
        })
    }

    /// Identifies `user`, or the stored user when `None`. Returns the key the
    /// user was identified under.
    pub async fn identify(&mut self, user: Option<UserData>) -> Result<String, TrackingError> {
        let client = self.require_client("identify")?;
        let data = user.unwrap_or_else(|| self.store.user_data());
        let key = Self::identity_key(&data, "identify")?;
        client
            .identify(&key, data.clone().into_traits())
            .await
            .map_err(|err| Self::delegate_failure("identify", err))?;

        self.session.current_user = Some(key.clone());
        self.emit("User Identified", Value::Object(data.into_traits()));
        Ok(key)
    }

    pub async fn track(
        &mut self,
        name: &str,
        properties: Option<Map<String, Value>>,
    ) -> Result<(), TrackingError> {
        let client = self.require_client("track")?;
        let properties = properties.unwrap_or_default();
        client
            .track(name, properties.clone())
            .await
            .map_err(|err| Self::delegate_failure("track", err))?;

        self.session.event_count += 1;
        self.emit(
            "Event Tracked",
            json!({ "name": name, "properties": properties }),
        );
        Ok(())
    }

    /// Records a page view; the name defaults to the current path.
    pub async fn page(
        &mut self,
        name: Option<&str>,
        properties: Option<Map<String, Value>>,
    ) -> Result<String, TrackingError> {
        let client = self.require_client("page")?;
        let page_name = name
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.location)
            .to_string();
        let properties = properties.unwrap_or_default();
        client
            .page(&page_name, properties.clone())
            .await
            .map_err(|err| Self::delegate_failure("page", err))?;

        self.session.event_count += 1;
        self.emit(
            "Page View Tracked",
            json!({ "page": page_name, "properties": properties }),
        );
        Ok(page_name)
    }

    /// Logs the visitor out. The client stays loaded and `initialized` stays
    /// set; a fresh anonymous id is issued when anonymous tracking is on.
    pub async fn reset(&mut self) -> Result<(), TrackingError> {
        let client = self.require_client("reset")?;
        client
            .reset()
            .await
            .map_err(|err| Self::delegate_failure("reset", err))?;
        self.session.current_user = None;

        if self.store.load().enable_anonymous {
            self.setup_anonymous_tracking().await;
        }
        self.emit("User Reset", json!({}));
        Ok(())
    }

    /// Identifies the current anonymous visitor, tagging the traits with the
    /// anonymous id it replaces.
    pub async fn convert_anonymous(
        &mut self,
        user: Option<UserData>,
    ) -> Result<String, TrackingError> {
        let client = self.require_client("convert_anonymous")?;
        let Some(previous) = self.session.anonymous_id.clone() else {
            error!("no anonymous user to convert");
            return Err(TrackingError::NoAnonymousUser);
        };

        let mut data = user.unwrap_or_else(|| self.store.user_data());
        let key = Self::identity_key(&data, "convert_anonymous")?;
        data.insert("anonymous_id", Value::String(previous.clone()));
        client
            .identify(&key, data.into_traits())
            .await
            .map_err(|err| Self::delegate_failure("convert_anonymous", err))?;

        self.session.current_user = Some(key.clone());
        self.session.anonymous_id = None;
        self.emit(
            "Anonymous User Converted",
            json!({ "from": previous, "to": key }),
        );
        Ok(key)
    }

    pub async fn track_form_view(&mut self, form_id: &str) -> Result<(), TrackingError> {
        self.track("form_viewed", Some(form_properties(form_id))).await
    }

    pub async fn track_form_start(&mut self, form_id: &str) -> Result<(), TrackingError> {
        self.track("form_started", Some(form_properties(form_id))).await
    }

    pub async fn track_form_submission(
        &mut self,
        form_id: &str,
        form_data: Map<String, Value>,
    ) -> Result<(), TrackingError> {
        let mut properties = Map::new();
        properties.insert("form_id".into(), Value::String(form_id.to_string()));
        properties.extend(form_data);
        properties.insert("timestamp".into(), Value::String(now_rfc3339()));
        self.track(&format!("form_submitted_{form_id}"), Some(properties))
            .await
    }

    pub async fn track_form_abandon(
        &mut self,
        form_id: &str,
        fields_completed: Vec<String>,
    ) -> Result<(), TrackingError> {
        let mut properties = form_properties(form_id);
        properties.insert("fields_completed".into(), json!(fields_completed));
        self.track("form_abandoned", Some(properties)).await
    }

    /// Sends a `test_connection` event through the loaded client.
    pub async fn test_connection(&mut self) -> Result<(), TrackingError> {
        let mut properties = Map::new();
        properties.insert("timestamp".into(), Value::String(now_rfc3339()));
        properties.insert("source".into(), Value::String("test_site".into()));
        self.track("test_connection", Some(properties)).await
    }

    pub fn status(&self) -> TrackerStatus {
        TrackerStatus {
            initialized: self.session.initialized,
            current_user: self.session.current_user.clone(),
            anonymous_id: self.session.anonymous_id.clone(),
            event_count: self.session.event_count,
            sdk_loaded: self.client.is_some(),
            phase: self.session.phase,
        }
    }

    fn emit(&self, kind: &str, data: Value) {
        info!(target: "cdp_harness::events", %kind, %data, "tracker event");
        let event = TrackerEvent {
            time: Local::now().format("%H:%M:%S").to_string(),
            kind: kind.to_string(),
            data,
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn form_properties(form_id: &str) -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert("form_id".into(), Value::String(form_id.to_string()));
    properties.insert("timestamp".into(), Value::String(now_rfc3339()));
    properties
}

fn mask_write_key(write_key: &str) -> String {
    let prefix: String = write_key.chars().take(8).collect();
    format!("{prefix}...")
}

/// `anon_<unix millis>_<9 random chars>`.
pub fn generate_anonymous_id() -> String {
    let entropy = Uuid::new_v4().simple().to_string();
    format!("anon_{}_{}", Utc::now().timestamp_millis(), &entropy[..9])
}
