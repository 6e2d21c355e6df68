use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::settings::now_rfc3339;

/// Integration name the in-app messaging plugin is configured under.
pub const IN_APP_PLUGIN: &str = "Customer.io In-App Plugin";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid pipelines url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("pipelines request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("pipelines api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("tracking client failed to load: {0}")]
    Load(String),
}

/// Options a client is loaded with; mirrors the vendor snippet's `load` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadOptions {
    pub write_key: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub integrations: Map<String, Value>,
}

impl LoadOptions {
    pub fn new(write_key: impl Into<String>) -> Self {
        Self {
            write_key: write_key.into(),
            integrations: Map::new(),
        }
    }

    pub fn with_anonymous_in_app(mut self, enabled: bool) -> Self {
        if enabled {
            self.integrations.insert(
                IN_APP_PLUGIN.to_string(),
                serde_json::json!({ "anonymousInApp": true }),
            );
        }
        self
    }
}

/// Call contract of the external tracking client.
#[async_trait]
pub trait TrackingClient: Send + Sync {
    async fn identify(&self, user_key: &str, traits: Map<String, Value>) -> Result<(), ClientError>;
    async fn track(&self, event: &str, properties: Map<String, Value>) -> Result<(), ClientError>;
    async fn page(&self, name: &str, properties: Map<String, Value>) -> Result<(), ClientError>;
    async fn reset(&self) -> Result<(), ClientError>;
    async fn set_anonymous_id(&self, anonymous_id: &str) -> Result<(), ClientError>;
}

/// Produces a ready client. Completion of `load` is the readiness signal.
#[async_trait]
pub trait ClientLoader: Send + Sync {
    async fn load(&self, options: LoadOptions) -> Result<Arc<dyn TrackingClient>, ClientError>;
}

#[derive(Clone, Debug)]
pub struct PipelinesConfig {
    pub api_base: Url,
    pub timeout: Duration,
}

#[derive(Debug)]
struct Identity {
    user_id: Option<String>,
    anonymous_id: String,
}

impl Identity {
    fn fresh() -> Self {
        Self {
            user_id: None,
            anonymous_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Client for the CDP pipelines HTTP API. Authenticates with the write key
/// as basic-auth user and sends one message per call.
pub struct HttpTrackingClient {
    api_base: Url,
    options: LoadOptions,
    client: reqwest::Client,
    identity: Mutex<Identity>,
}

impl HttpTrackingClient {
    pub fn new(cfg: &PipelinesConfig, options: LoadOptions) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            api_base: cfg.api_base.clone(),
            options,
            client,
            identity: Mutex::new(Identity::fresh()),
        })
    }

    fn identity(&self) -> std::sync::MutexGuard<'_, Identity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn envelope(&self) -> Map<String, Value> {
        let mut envelope = Map::new();
        {
            let identity = self.identity();
            if let Some(user_id) = &identity.user_id {
                envelope.insert("userId".into(), Value::String(user_id.clone()));
            }
            envelope.insert(
                "anonymousId".into(),
                Value::String(identity.anonymous_id.clone()),
            );
        }
        envelope.insert(
            "messageId".into(),
            Value::String(Uuid::new_v4().to_string()),
        );
        envelope.insert("timestamp".into(), Value::String(now_rfc3339()));
        if !self.options.integrations.is_empty() {
            envelope.insert(
                "integrations".into(),
                Value::Object(self.options.integrations.clone()),
            );
        }
        envelope
    }

    /// Posts `body` merged over the identity envelope; keys in `body` win.
    async fn send(&self, path: &str, body: Map<String, Value>) -> Result<(), ClientError> {
        let url = self.api_base.join(path)?;
        let mut payload = self.envelope();
        payload.extend(body);
        let resp = self
            .client
            .post(url)
            .basic_auth(&self.options.write_key, Some(""))
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(%path, %status, "pipelines call accepted");
        Ok(())
    }
}

#[async_trait]
impl TrackingClient for HttpTrackingClient {
    async fn identify(&self, user_key: &str, traits: Map<String, Value>) -> Result<(), ClientError> {
        let mut body = Map::new();
        body.insert("userId".into(), Value::String(user_key.to_string()));
        body.insert("traits".into(), Value::Object(traits));
        self.send("identify", body).await?;
        self.identity().user_id = Some(user_key.to_string());
        Ok(())
    }

    async fn track(&self, event: &str, properties: Map<String, Value>) -> Result<(), ClientError> {
        let mut body = Map::new();
        body.insert("event".into(), Value::String(event.to_string()));
        body.insert("properties".into(), Value::Object(properties));
        self.send("track", body).await
    }

    async fn page(&self, name: &str, properties: Map<String, Value>) -> Result<(), ClientError> {
        let mut body = Map::new();
        body.insert("name".into(), Value::String(name.to_string()));
        body.insert("properties".into(), Value::Object(properties));
        self.send("page", body).await
    }

    async fn reset(&self) -> Result<(), ClientError> {
        *self.identity() = Identity::fresh();
        Ok(())
    }

    async fn set_anonymous_id(&self, anonymous_id: &str) -> Result<(), ClientError> {
        self.identity().anonymous_id = anonymous_id.to_string();
        Ok(())
    }
}

pub struct HttpClientLoader {
    config: PipelinesConfig,
}

impl HttpClientLoader {
    pub fn new(config: PipelinesConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientLoader for HttpClientLoader {
    async fn load(&self, options: LoadOptions) -> Result<Arc<dyn TrackingClient>, ClientError> {
        let client = HttpTrackingClient::new(&self.config, options)
            .map_err(|err| ClientError::Load(err.to_string()))?;
        info!(api_base = %self.config.api_base, "pipelines client loaded");
        Ok(Arc::new(client))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Identify {
        user_key: String,
        traits: Map<String, Value>,
    },
    Track {
        event: String,
        properties: Map<String, Value>,
    },
    Page {
        name: String,
        properties: Map<String, Value>,
    },
    Reset,
    SetAnonymousId(String),
}

/// In-process client that records calls instead of sending them. Backs the
/// `--dry-run` mode.
#[derive(Default)]
pub struct RecordingTrackingClient {
    calls: Mutex<Vec<RecordedCall>>,
    fail_status: Option<u16>,
}

impl RecordingTrackingClient {
    /// Every call fails as if the pipelines api answered `status`.
    #[allow(dead_code)]
    pub fn failing(status: u16) -> Self {
        Self {
            calls: Mutex::default(),
            fail_status: Some(status),
        }
    }

    #[allow(dead_code)]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: RecordedCall) -> Result<(), ClientError> {
        if let Some(status) = self.fail_status {
            return Err(ClientError::Status {
                status,
                body: "recording client configured to fail".into(),
            });
        }
        info!(?call, "dry-run tracking call");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        Ok(())
    }
}

#[async_trait]
impl TrackingClient for RecordingTrackingClient {
    async fn identify(&self, user_key: &str, traits: Map<String, Value>) -> Result<(), ClientError> {
        self.record(RecordedCall::Identify {
            user_key: user_key.to_string(),
            traits,
        })
    }

    async fn track(&self, event: &str, properties: Map<String, Value>) -> Result<(), ClientError> {
        self.record(RecordedCall::Track {
            event: event.to_string(),
            properties,
        })
    }

    async fn page(&self, name: &str, properties: Map<String, Value>) -> Result<(), ClientError> {
        self.record(RecordedCall::Page {
            name: name.to_string(),
            properties,
        })
    }

    async fn reset(&self) -> Result<(), ClientError> {
        self.record(RecordedCall::Reset)
    }

    async fn set_anonymous_id(&self, anonymous_id: &str) -> Result<(), ClientError> {
        self.record(RecordedCall::SetAnonymousId(anonymous_id.to_string()))
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBehavior {
    Ready,
    Never,
    Fail,
}

/// Loader handing out one shared recording client.
pub struct RecordingLoader {
    client: Arc<RecordingTrackingClient>,
    behavior: LoadBehavior,
    loads: Mutex<Vec<LoadOptions>>,
}

impl RecordingLoader {
    pub fn new(client: Arc<RecordingTrackingClient>, behavior: LoadBehavior) -> Self {
        Self {
            client,
            behavior,
            loads: Mutex::default(),
        }
    }

    pub fn ready(client: Arc<RecordingTrackingClient>) -> Self {
        Self::new(client, LoadBehavior::Ready)
    }

    #[allow(dead_code)]
    pub fn loads(&self) -> Vec<LoadOptions> {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClientLoader for RecordingLoader {
    async fn load(&self, options: LoadOptions) -> Result<Arc<dyn TrackingClient>, ClientError> {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(options);
        match self.behavior {
            LoadBehavior::Ready => {
                let client: Arc<dyn TrackingClient> = self.client.clone();
                Ok(client)
            }
            LoadBehavior::Never => std::future::pending().await,
            LoadBehavior::Fail => Err(ClientError::Load("script failed to load".into())),
        }
    }
}
