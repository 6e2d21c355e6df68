use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Key the settings record is persisted under.
pub const STORAGE_KEY: &str = "customerio_test_config";

/// Event property literal replaced with the current time at read time.
pub const AUTO_TIMESTAMP: &str = "auto";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("settings storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings record is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raw persistence for the single settings record.
pub trait SettingsBackend: Send + Sync {
    fn read(&self) -> Result<Option<String>, StorageError>;
    fn write(&self, contents: &str) -> Result<(), StorageError>;
    fn remove(&self) -> Result<(), StorageError>;
}

/// Stores the record as `<dir>/customerio_test_config.json`.
pub struct FileSettingsBackend {
    dir: PathBuf,
    path: PathBuf,
}

impl FileSettingsBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(format!("{STORAGE_KEY}.json"));
        Self { dir, path }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsBackend for FileSettingsBackend {
    fn read(&self) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, contents: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        debug!(path = ?self.path, "persisted settings record");
        Ok(())
    }

    fn remove(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Default)]
pub struct MemorySettingsBackend {
    slot: Mutex<Option<String>>,
}

impl SettingsBackend for MemorySettingsBackend {
    fn read(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn write(&self, contents: &str) -> Result<(), StorageError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(contents.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<(), StorageError> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// A mapping-valued setting. Older records may hold the mapping as raw JSON
/// text; `save` normalizes parseable text into an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonField {
    Object(Map<String, Value>),
    Text(String),
}

impl Default for JsonField {
    fn default() -> Self {
        JsonField::Object(Map::new())
    }
}

impl JsonField {
    pub fn parse(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match self {
            JsonField::Object(map) => Ok(map.clone()),
            JsonField::Text(text) => serde_json::from_str(text),
        }
    }

    pub fn object_or_empty(&self) -> Map<String, Value> {
        self.parse().unwrap_or_default()
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, JsonField::Text(_)) && self.parse().is_err()
    }

    fn normalized(self) -> Self {
        match self.parse() {
            Ok(map) => JsonField::Object(map),
            Err(_) => self,
        }
    }
}

/// The persisted harness configuration. Keys this struct does not know are
/// kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub write_key: String,
    pub user_id: String,
    pub user_email: String,
    pub user_attributes: JsonField,
    pub event_name: String,
    pub event_properties: JsonField,
    pub enable_anonymous: bool,
    pub enable_anonymous_in_app: bool,
    pub anonymous_id: String,
    pub auto_capture_forms: bool,
    pub capture_all_fields: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            write_key: String::new(),
            user_id: "test_user_001".into(),
            user_email: "test@example.com".into(),
            user_attributes: JsonField::Object(object(json!({
                "first_name": "Test",
                "last_name": "User",
                "plan": "premium",
                "created_at": Utc::now().timestamp(),
            }))),
            event_name: "page_viewed".into(),
            event_properties: JsonField::Object(object(json!({
                "page": "test_page",
                "category": "testing",
                "timestamp": AUTO_TIMESTAMP,
            }))),
            enable_anonymous: true,
            enable_anonymous_in_app: false,
            anonymous_id: String::new(),
            auto_capture_forms: true,
            capture_all_fields: true,
            extra: Map::new(),
        }
    }
}

impl Settings {
    fn normalized(mut self) -> Self {
        self.user_attributes = self.user_attributes.normalized();
        self.event_properties = self.event_properties.normalized();
        self
    }

    fn to_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(<serde_json::Error as serde::ser::Error>::custom(
                "settings did not serialize to an object",
            )),
        }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkConfig {
    pub write_key: String,
    pub enable_anonymous: bool,
    pub enable_anonymous_in_app: bool,
}

/// Identity payload: `id`, `email` and any spread attributes. Attributes
/// named `id` or `email` win over the top-level fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserData(Map<String, Value>);

impl UserData {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(id.into()));
        map.insert("email".into(), Value::String(email.into()));
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.0.extend(attributes);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The identify key: `id` when it is set, otherwise `email`.
    pub fn key(&self) -> Option<String> {
        identity_value(self.0.get("id")).or_else(|| identity_value(self.0.get("email")))
    }

    pub fn into_traits(self) -> Map<String, Value> {
        self.0
    }
}

fn identity_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventData {
    pub name: String,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Settings persistence plus the derived views the tracker consumes.
///
/// Persistence failures never escape: they are logged and reported as a
/// `false` return (or defaults, for reads).
#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn SettingsBackend>,
    /// Built once so every load without a stored record yields the same
    /// defaults (`created_at` included).
    defaults: Arc<Settings>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn SettingsBackend>) -> Self {
        Self {
            backend,
            defaults: Arc::new(Settings::default()),
        }
    }

    #[allow(dead_code)]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemorySettingsBackend::default()))
    }

    pub fn load(&self) -> Settings {
        match self.try_load() {
            Ok(settings) => settings,
            Err(err) => {
                error!(?err, "error loading settings; using defaults");
                self.defaults.as_ref().clone()
            }
        }
    }

    /// Stored values win per top-level key. A stored value that does not fit
    /// its field is dropped in favor of that field's default.
    fn try_load(&self) -> Result<Settings, StorageError> {
        let Some(raw) = self.backend.read()? else {
            return Ok(self.defaults.as_ref().clone());
        };
        if raw.trim().is_empty() {
            return Ok(self.defaults.as_ref().clone());
        }
        let stored: Map<String, Value> = serde_json::from_str(&raw)?;
        let mut merged = self.defaults.to_map()?;
        for (key, value) in stored {
            if fits_field(&key, &value) {
                merged.insert(key, value);
            } else {
                warn!(%key, "stored setting has the wrong shape; using default");
            }
        }
        Ok(serde_json::from_value(Value::Object(merged))?)
    }

    pub fn save(&self, settings: &Settings) -> bool {
        match self.try_save(settings) {
            Ok(()) => true,
            Err(err) => {
                error!(?err, "error saving settings");
                false
            }
        }
    }

    fn try_save(&self, settings: &Settings) -> Result<(), StorageError> {
        let normalized = settings.clone().normalized();
        let raw = serde_json::to_string(&normalized)?;
        self.backend.write(&raw)
    }

    pub fn clear(&self) -> bool {
        match self.backend.remove() {
            Ok(()) => true,
            Err(err) => {
                error!(?err, "error clearing settings");
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.load().to_map().ok()?.remove(key)
    }

    pub fn set(&self, key: &str, value: Value) -> bool {
        let mut partial = Map::new();
        partial.insert(key.to_string(), value);
        self.update(partial)
    }

    /// Shallow-merges `partial` over the stored record. Values that no longer
    /// fit the record's shape are rejected and nothing is written.
    pub fn update(&self, partial: Map<String, Value>) -> bool {
        let mut merged = match self.load().to_map() {
            Ok(map) => map,
            Err(err) => {
                error!(?err, "error serializing settings for update");
                return false;
            }
        };
        merged.extend(partial);
        match serde_json::from_value::<Settings>(Value::Object(merged)) {
            Ok(settings) => self.save(&settings),
            Err(err) => {
                warn!(?err, "rejected settings update");
                false
            }
        }
    }

    pub fn validate(&self) -> ValidationReport {
        let settings = self.load();
        let mut errors = Vec::new();
        if settings.write_key.trim().is_empty() {
            errors.push("Write Key is required".to_string());
        }
        if settings.user_attributes.is_malformed() {
            errors.push("User Attributes must be valid JSON".to_string());
        }
        if settings.event_properties.is_malformed() {
            errors.push("Event Properties must be valid JSON".to_string());
        }
        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn sdk_config(&self) -> SdkConfig {
        let settings = self.load();
        SdkConfig {
            write_key: settings.write_key,
            enable_anonymous: settings.enable_anonymous,
            enable_anonymous_in_app: settings.enable_anonymous_in_app,
        }
    }

    pub fn user_data(&self) -> UserData {
        let settings = self.load();
        UserData::new(settings.user_id, settings.user_email)
            .with_attributes(settings.user_attributes.object_or_empty())
    }

    pub fn event_data(&self) -> EventData {
        let settings = self.load();
        let mut properties = settings.event_properties.object_or_empty();
        if properties.get("timestamp").and_then(Value::as_str) == Some(AUTO_TIMESTAMP) {
            properties.insert("timestamp".into(), Value::String(now_rfc3339()));
        }
        EventData {
            name: settings.event_name,
            properties,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.load().write_key.trim().is_empty()
    }
}

fn fits_field(key: &str, value: &Value) -> bool {
    let mut single = Map::new();
    single.insert(key.to_string(), value.clone());
    serde_json::from_value::<Settings>(Value::Object(single)).is_ok()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenBackend;

    impl SettingsBackend for BrokenBackend {
        fn read(&self) -> Result<Option<String>, StorageError> {
            Err(std::io::Error::other("read refused").into())
        }

        fn write(&self, _contents: &str) -> Result<(), StorageError> {
            Err(std::io::Error::other("quota exceeded").into())
        }

        fn remove(&self) -> Result<(), StorageError> {
            Err(std::io::Error::other("remove refused").into())
        }
    }

    fn configured() -> Settings {
        Settings {
            write_key: "wk_live_123456789".into(),
            user_attributes: JsonField::Object(object(json!({"plan": "pro", "seats": 3}))),
            event_properties: JsonField::Object(object(json!({"page": "checkout"}))),
            anonymous_id: "anon_1_abc".into(),
            ..Settings::default()
        }
    }

    #[test]
    fn empty_store_loads_defaults() {
        let store = SettingsStore::in_memory();
        let loaded = store.load();
        assert_eq!(&loaded, store.defaults.as_ref());
        assert_eq!(loaded.user_id, "test_user_001");
        assert!(loaded.enable_anonymous);
        assert!(!loaded.enable_anonymous_in_app);
    }

    #[test]
    fn defaults_are_stable_across_loads() {
        let store = SettingsStore::in_memory();
        let first = store.load();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert_eq!(store.load(), first);

        assert!(store.save(&configured()));
        assert!(store.clear());
        assert_eq!(store.load(), first);
    }

    #[test]
    fn wrong_typed_field_falls_back_per_key() {
        let backend = Arc::new(MemorySettingsBackend::default());
        backend
            .write(r#"{"writeKey":"wk_live","userId":"u-9","anonymousId":null,"userAttributes":[1,2]}"#)
            .unwrap();
        let store = SettingsStore::new(backend);
        let loaded = store.load();
        assert_eq!(loaded.write_key, "wk_live");
        assert_eq!(loaded.user_id, "u-9");
        assert_eq!(loaded.anonymous_id, "");
        assert_eq!(loaded.user_attributes, store.defaults.user_attributes);
        assert!(store.is_configured());
    }

    #[test]
    fn save_then_load_round_trips() {
        let store = SettingsStore::in_memory();
        let settings = configured();
        assert!(store.save(&settings));
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn unknown_keys_pass_through() {
        let backend = Arc::new(MemorySettingsBackend::default());
        backend
            .write(r#"{"writeKey":"wk","customFlag":{"nested":true}}"#)
            .unwrap();
        let store = SettingsStore::new(backend.clone());
        let loaded = store.load();
        assert_eq!(loaded.write_key, "wk");
        assert_eq!(loaded.extra["customFlag"], json!({"nested": true}));

        assert!(store.save(&loaded));
        let raw: Value = serde_json::from_str(&backend.read().unwrap().unwrap()).unwrap();
        assert_eq!(raw["customFlag"], json!({"nested": true}));
    }

    #[test]
    fn missing_keys_are_filled_from_defaults() {
        let backend = Arc::new(MemorySettingsBackend::default());
        backend.write(r#"{"userId":"u-42"}"#).unwrap();
        let loaded = SettingsStore::new(backend).load();
        assert_eq!(loaded.user_id, "u-42");
        assert_eq!(loaded.user_email, "test@example.com");
        assert_eq!(loaded.event_name, "page_viewed");
    }

    #[test]
    fn update_preserves_other_fields() {
        let store = SettingsStore::in_memory();
        assert!(store.save(&configured()));
        assert!(store.update(object(json!({"eventName": "signup", "x": 1}))));

        let loaded = store.load();
        assert_eq!(loaded.event_name, "signup");
        assert_eq!(loaded.extra["x"], json!(1));
        assert_eq!(loaded.write_key, "wk_live_123456789");
        assert_eq!(loaded.anonymous_id, "anon_1_abc");
    }

    #[test]
    fn update_rejects_values_that_break_the_record() {
        let store = SettingsStore::in_memory();
        assert!(store.save(&configured()));
        assert!(!store.set("enableAnonymous", json!("yes please")));
        assert!(store.load().enable_anonymous);
    }

    #[test]
    fn get_and_set_single_fields() {
        let store = SettingsStore::in_memory();
        assert!(store.set("autoCaptureForms", json!(false)));
        assert_eq!(store.get("autoCaptureForms"), Some(json!(false)));
        assert_eq!(store.get("userId"), Some(json!("test_user_001")));
        assert_eq!(store.get("nope"), None);
    }

    #[test]
    fn validate_flags_blank_key_and_malformed_text() {
        let backend = Arc::new(MemorySettingsBackend::default());
        backend
            .write(r#"{"writeKey":"   ","userAttributes":"{not json","eventProperties":"[1,"}"#)
            .unwrap();
        let report = SettingsStore::new(backend).validate();
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec![
                "Write Key is required",
                "User Attributes must be valid JSON",
                "Event Properties must be valid JSON",
            ]
        );
    }

    #[test]
    fn validate_passes_well_formed_configuration() {
        let backend = Arc::new(MemorySettingsBackend::default());
        backend
            .write(r#"{"writeKey":"wk","userAttributes":"{\"plan\":\"pro\"}"}"#)
            .unwrap();
        let report = SettingsStore::new(backend).validate();
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn save_normalizes_text_fields() {
        let backend = Arc::new(MemorySettingsBackend::default());
        let store = SettingsStore::new(backend.clone());
        let settings = Settings {
            user_attributes: JsonField::Text(r#"{"plan":"basic"}"#.into()),
            event_properties: JsonField::Text("oops".into()),
            ..Settings::default()
        };
        assert!(store.save(&settings));

        let raw: Value = serde_json::from_str(&backend.read().unwrap().unwrap()).unwrap();
        assert_eq!(raw["userAttributes"], json!({"plan": "basic"}));
        assert_eq!(raw["eventProperties"], json!("oops"));
    }

    #[test]
    fn user_data_spreads_attributes() {
        let store = SettingsStore::in_memory();
        let settings = Settings {
            user_id: "u-1".into(),
            user_email: "u1@example.com".into(),
            user_attributes: JsonField::Text(r#"{"plan":"pro","email":"alt@example.com"}"#.into()),
            ..Settings::default()
        };
        assert!(store.save(&settings));

        let user = store.user_data();
        assert_eq!(user.key().as_deref(), Some("u-1"));
        assert_eq!(user.get("plan"), Some(&json!("pro")));
        assert_eq!(user.get("email"), Some(&json!("alt@example.com")));
    }

    #[test]
    fn user_data_tolerates_malformed_attributes() {
        let backend = Arc::new(MemorySettingsBackend::default());
        backend.write(r#"{"userAttributes":"{broken"}"#).unwrap();
        let user = SettingsStore::new(backend).user_data();
        assert_eq!(
            user.into_traits(),
            object(json!({"id": "test_user_001", "email": "test@example.com"}))
        );
    }

    #[test]
    fn user_key_falls_back_to_email() {
        let user = UserData::new("", "only@example.com");
        assert_eq!(user.key().as_deref(), Some("only@example.com"));
        assert_eq!(UserData::default().key(), None);
    }

    #[test]
    fn event_data_fills_auto_timestamp() {
        let store = SettingsStore::in_memory();
        let first = store.event_data();
        let stamp = first.properties["timestamp"].as_str().unwrap();
        assert_ne!(stamp, AUTO_TIMESTAMP);
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert_eq!(first.name, "page_viewed");
        assert_eq!(first.properties["page"], json!("test_page"));
    }

    #[test]
    fn event_data_keeps_literal_timestamp() {
        let store = SettingsStore::in_memory();
        assert!(store.set("eventProperties", json!({"timestamp": "2024-01-01"})));
        assert_eq!(store.event_data().properties["timestamp"], json!("2024-01-01"));
    }

    #[test]
    fn corrupt_record_loads_defaults() {
        let backend = Arc::new(MemorySettingsBackend::default());
        backend.write("{{{").unwrap();
        let store = SettingsStore::new(backend);
        assert_eq!(store.load().user_id, "test_user_001");
        assert!(!store.is_configured());
    }

    #[test]
    fn storage_failures_surface_as_false() {
        let store = SettingsStore::new(Arc::new(BrokenBackend));
        assert!(!store.save(&configured()));
        assert!(!store.clear());
        assert!(!store.set("userId", json!("x")));
        assert_eq!(store.load().user_id, "test_user_001");
    }

    #[test]
    fn is_configured_requires_non_blank_key() {
        let store = SettingsStore::in_memory();
        assert!(!store.is_configured());
        assert!(store.set("writeKey", json!("  ")));
        assert!(!store.is_configured());
        assert!(store.set("writeKey", json!("wk")));
        assert!(store.is_configured());
        assert!(store.sdk_config().enable_anonymous);
    }

    #[test]
    fn file_backend_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FileSettingsBackend::new(dir.path().join("state")));
        let store = SettingsStore::new(backend.clone());
        assert!(store.save(&configured()));
        assert!(backend.path().exists());
        assert!(
            backend
                .path()
                .to_string_lossy()
                .ends_with("customerio_test_config.json")
        );

        let reopened = SettingsStore::new(Arc::new(FileSettingsBackend::new(
            dir.path().join("state"),
        )));
        assert_eq!(reopened.load(), configured());

        assert!(store.clear());
        assert!(!backend.path().exists());
        assert!(store.clear());
    }
}
