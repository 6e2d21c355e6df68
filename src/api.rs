use crate::forms::{FormSession, FormSubmission, capture_submission};
use crate::server::AppState;
use crate::settings::{JsonField, Settings, UserData};
use crate::tracker::TrackingError;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

/// Open form sessions kept at once; further forms are refused until one
/// is submitted or abandoned.
const MAX_FORM_SESSIONS: usize = 64;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// JSON body extractor whose rejections use the `{"error": ...}` shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

pub struct ApiError(Response);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!(error = %rejection.body_text(), "rejected request body");
        Self(error_response(StatusCode::BAD_REQUEST, rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.0
    }
}

fn tracking_error_response(err: TrackingError) -> Response {
    let status = match &err {
        TrackingError::MissingWriteKey | TrackingError::MissingIdentity => StatusCode::BAD_REQUEST,
        TrackingError::ClientMissing | TrackingError::NoAnonymousUser => StatusCode::CONFLICT,
        TrackingError::LoadTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        TrackingError::Load(_) | TrackingError::Delegate(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(status, err.to_string())
}

/// Fields submitted by the configuration panel.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsForm {
    pub write_key: String,
    pub enable_anonymous_in_app: bool,
    pub user_id: String,
    pub user_email: String,
    pub user_attributes: JsonField,
    pub event_name: String,
    pub event_properties: JsonField,
    pub enable_anonymous: bool,
    pub anonymous_id: String,
}

impl SettingsForm {
    /// Applies the panel's fields over `base`. Mapping fields submitted as
    /// text are parsed here so the store only ever sees objects.
    pub fn apply(self, mut base: Settings) -> Result<Settings, String> {
        base.user_attributes = parse_form_json(self.user_attributes, "User Attributes")?;
        base.event_properties = parse_form_json(self.event_properties, "Event Properties")?;
        let write_key = self.write_key.trim();
        if write_key.is_empty() {
            return Err("Write Key is required".into());
        }
        base.write_key = write_key.to_string();
        base.enable_anonymous_in_app = self.enable_anonymous_in_app;
        base.user_id = self.user_id.trim().to_string();
        base.user_email = self.user_email.trim().to_string();
        base.event_name = self.event_name.trim().to_string();
        base.enable_anonymous = self.enable_anonymous;
        base.anonymous_id = self.anonymous_id.trim().to_string();
        Ok(base)
    }
}

fn parse_form_json(field: JsonField, label: &str) -> Result<JsonField, String> {
    match field {
        JsonField::Object(map) => Ok(JsonField::Object(map)),
        JsonField::Text(text) if text.trim().is_empty() => Ok(JsonField::default()),
        JsonField::Text(text) => serde_json::from_str::<Map<String, Value>>(text.trim())
            .map(JsonField::Object)
            .map_err(|_| format!("Invalid JSON in {label} field")),
    }
}

pub async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.load())
}

/// Saves the panel and (re)initializes the tracker with the new settings.
pub async fn put_settings(
    State(state): State<AppState>,
    ApiJson(form): ApiJson<SettingsForm>,
) -> impl IntoResponse {
    let settings = match form.apply(state.store.load()) {
        Ok(settings) => settings,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, message),
    };
    if !state.store.save(&settings) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save configuration",
        );
    }
    info!("configuration saved");

    let mut tracker = state.tracker.lock().await;
    let initialized = match tracker.initialize().await {
        Ok(()) => json!({ "initialized": true }),
        Err(err) => {
            warn!(?err, "re-initialization after save failed");
            json!({ "initialized": false, "error": err.to_string() })
        }
    };
    Json(json!({
        "saved": true,
        "settings": settings,
        "tracker": initialized,
        "status": tracker.status(),
    }))
    .into_response()
}

pub async fn patch_settings(
    State(state): State<AppState>,
    ApiJson(partial): ApiJson<Map<String, Value>>,
) -> impl IntoResponse {
    if state.store.update(partial) {
        Json(state.store.load()).into_response()
    } else {
        error_response(StatusCode::BAD_REQUEST, "settings update rejected")
    }
}

pub async fn delete_settings(State(state): State<AppState>) -> impl IntoResponse {
    if state.store.clear() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to clear configuration",
        )
    }
}

pub async fn validate_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.validate())
}

pub async fn get_sdk_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.sdk_config())
}

pub async fn get_user_data(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.user_data())
}

pub async fn get_event_data(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.event_data())
}

pub async fn get_field(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.store.get(&key) {
        Some(value) => Json(json!({ "key": key, "value": value })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown setting {key}")),
    }
}

pub async fn put_field(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ApiJson(value): ApiJson<Value>,
) -> impl IntoResponse {
    if state.store.set(&key, value) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::BAD_REQUEST, format!("could not set {key}"))
    }
}

pub async fn tracker_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tracker.lock().await.status())
}

pub async fn initialize(State(state): State<AppState>) -> impl IntoResponse {
    let mut tracker = state.tracker.lock().await;
    match tracker.initialize().await {
        Ok(()) => Json(tracker.status()).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IdentifyRequest {
    pub user: Option<Map<String, Value>>,
}

pub async fn identify(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<IdentifyRequest>,
) -> impl IntoResponse {
    let mut tracker = state.tracker.lock().await;
    match tracker.identify(body.user.map(UserData::from_map)).await {
        Ok(user) => Json(json!({ "user": user, "status": tracker.status() })).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrackRequest {
    pub name: Option<String>,
    pub properties: Option<Map<String, Value>>,
}

/// Tracks the named event, or the configured event when no name is given.
pub async fn track(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<TrackRequest>,
) -> impl IntoResponse {
    let (name, properties) = match body.name {
        Some(name) => (name, body.properties),
        None => {
            let event = state.store.event_data();
            (event.name, body.properties.or(Some(event.properties)))
        }
    };
    let mut tracker = state.tracker.lock().await;
    match tracker.track(&name, properties).await {
        Ok(()) => Json(json!({ "event": name, "status": tracker.status() })).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    pub name: Option<String>,
    pub properties: Option<Map<String, Value>>,
    /// Current path of the calling page; becomes the default page name.
    pub path: Option<String>,
}

pub async fn page(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<PageRequest>,
) -> impl IntoResponse {
    let mut tracker = state.tracker.lock().await;
    if let Some(path) = body.path {
        tracker.navigate(path);
    }
    match tracker.page(body.name.as_deref(), body.properties).await {
        Ok(page) => Json(json!({ "page": page, "status": tracker.status() })).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

pub async fn reset(State(state): State<AppState>) -> impl IntoResponse {
    let mut tracker = state.tracker.lock().await;
    match tracker.reset().await {
        Ok(()) => Json(tracker.status()).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

pub async fn convert_anonymous(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<IdentifyRequest>,
) -> impl IntoResponse {
    let mut tracker = state.tracker.lock().await;
    match tracker
        .convert_anonymous(body.user.map(UserData::from_map))
        .await
    {
        Ok(user) => Json(json!({ "user": user, "status": tracker.status() })).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

pub async fn test_connection(State(state): State<AppState>) -> impl IntoResponse {
    let mut tracker = state.tracker.lock().await;
    match tracker.test_connection().await {
        Ok(()) => Json(json!({ "message": "Connection successful" })).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

pub async fn form_view(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
) -> impl IntoResponse {
    match state.tracker.lock().await.track_form_view(&form_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => tracking_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct FocusRequest {
    pub field: String,
    #[serde(default)]
    pub required: Vec<String>,
}

/// Records a field focus; the first focus of a session tracks
/// `form_started`.
pub async fn form_focus(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
    ApiJson(body): ApiJson<FocusRequest>,
) -> impl IntoResponse {
    let first = {
        let mut forms = state.forms.lock().await;
        let session = match form_session(&mut forms, &form_id) {
            Ok(session) => session,
            Err(resp) => return resp,
        };
        session.require(body.required);
        session.focus(body.field)
    };
    if first
        && let Err(err) = state.tracker.lock().await.track_form_start(&form_id).await
    {
        return tracking_error_response(err);
    }
    Json(json!({ "started": first })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlurRequest {
    pub field: String,
    #[serde(default)]
    pub has_value: bool,
}

pub async fn form_blur(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
    ApiJson(body): ApiJson<BlurRequest>,
) -> impl IntoResponse {
    let mut forms = state.forms.lock().await;
    match form_session(&mut forms, &form_id) {
        Ok(session) => {
            session.blur(body.field, body.has_value);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(resp) => resp,
    }
}

fn form_session<'a>(
    forms: &'a mut HashMap<String, FormSession>,
    form_id: &str,
) -> Result<&'a mut FormSession, Response> {
    if !forms.contains_key(form_id) && forms.len() >= MAX_FORM_SESSIONS {
        warn!(%form_id, open = forms.len(), "too many open form sessions");
        return Err(error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "too many open form sessions",
        ));
    }
    Ok(forms.entry(form_id.to_string()).or_default())
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Raw `[name, value]` pairs in form order.
    pub fields: Vec<(String, String)>,
}

pub async fn form_submit(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
    ApiJson(body): ApiJson<SubmitRequest>,
) -> impl IntoResponse {
    let submission = FormSubmission::from_pairs(body.fields);
    let outcome = {
        let mut tracker = state.tracker.lock().await;
        capture_submission(&mut tracker, &form_id, submission).await
    };
    match outcome {
        Ok(outcome) => {
            state.forms.lock().await.remove(&form_id);
            Json(outcome).into_response()
        }
        Err(err) => tracking_error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AbandonRequest {
    /// Fields that currently hold a value.
    pub filled: BTreeSet<String>,
}

/// Ends the form's session, tracking `form_abandoned` when the form was
/// started and a required field is still empty.
pub async fn form_abandon(
    State(state): State<AppState>,
    Path(form_id): Path<String>,
    ApiJson(body): ApiJson<AbandonRequest>,
) -> impl IntoResponse {
    let fields = state
        .forms
        .lock()
        .await
        .remove(&form_id)
        .filter(|session| session.should_abandon(&body.filled))
        .map(|session| session.fields_interacted());
    let Some(fields) = fields else {
        return Json(json!({ "abandoned": false })).into_response();
    };
    match state
        .tracker
        .lock()
        .await
        .track_form_abandon(&form_id, fields)
        .await
    {
        Ok(()) => Json(json!({ "abandoned": true })).into_response(),
        Err(err) => tracking_error_response(err),
    }
}

/// Server-sent stream of tracker events, one `cio-event` per action.
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|msg| match msg {
        Ok(event) => Event::default()
            .event("cio-event")
            .json_data(&event)
            .ok()
            .map(Ok::<Event, Infallible>),
        Err(err) => {
            warn!(?err, "event stream subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
