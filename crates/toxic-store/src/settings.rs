//! Typed settings schema and the legacy document encoding.
//!
//! On disk the global settings document is a flat JSON object whose boolean
//! values are the strings `"true"` / `"false"`; older documents may also
//! carry raw JSON booleans. [`Settings::from_document`] and
//! [`Settings::to_document`] are the only places that know about that
//! encoding. Everything above this module works with [`SettingValue`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Raw on-disk shape of the settings document.
pub type SettingsDocument = BTreeMap<String, Value>;

/// Default global settings, written on first initialization and backfilled
/// into existing documents.
pub const DEFAULT_SETTINGS: &[(&str, &str)] = &[
    ("prefix", "."),
    ("packname", "Toxic-MD"),
    ("mode", "public"),
    ("presence", "online"),
    ("autoview", "true"),
    ("autolike", "false"),
    ("autoread", "false"),
    ("autobio", "false"),
    ("anticall", "false"),
    ("chatbotpm", "false"),
    ("autolikeemoji", "❤️"),
    ("antilink", "off"),
    ("antidelete", "false"),
    ("antiedit", "false"),
    ("antistatusmention", "delete"),
    ("startmessage", "true"),
];

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A single decoded setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Text(String),
}

impl SettingValue {
    /// Decode one raw document value. `null` has no setting equivalent.
    fn decode(raw: &Value) -> Option<Self> {
        match raw {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::String(s) if s == "true" => Some(Self::Bool(true)),
            Value::String(s) if s == "false" => Some(Self::Bool(false)),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Null => None,
            other => Some(Self::Text(other.to_string())),
        }
    }

    /// Encode for the settings document (booleans become strings).
    fn encode(&self) -> Value {
        match self {
            Self::Bool(true) => Value::String("true".into()),
            Self::Bool(false) => Value::String("false".into()),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bool(_) => None,
        }
    }

    /// Plain JSON form used in group records, where booleans stay booleans.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Operating mode of the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Commands are accepted from anyone.
    Public,
    /// Commands are accepted from the owner and sudo users only.
    Private,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
        }
    }
}

// ---------------------------------------------------------------------------
// Global settings
// ---------------------------------------------------------------------------

/// Decoded global settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, SettingValue>,
}

impl Settings {
    /// A settings object with no keys at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in default key set.
    pub fn defaults() -> Self {
        let raw: SettingsDocument = DEFAULT_SETTINGS
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
            .collect();
        Self::from_document(&raw)
    }

    /// Decode a raw settings document, coercing legacy string booleans.
    pub fn from_document(doc: &SettingsDocument) -> Self {
        let values = doc
            .iter()
            .filter_map(|(k, v)| SettingValue::decode(v).map(|v| (k.clone(), v)))
            .collect();
        Self { values }
    }

    /// Encode back to the document shape.
    pub fn to_document(&self) -> SettingsDocument {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.encode()))
            .collect()
    }

    /// Encode a single value the way [`Settings::to_document`] would.
    pub fn encode_value(value: &SettingValue) -> Value {
        value.encode()
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Boolean toggle; absent or non-boolean keys read as off.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(SettingValue::as_bool).unwrap_or(false)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(SettingValue::as_str)
    }

    /// Command prefix, falling back to the default `.`.
    pub fn prefix(&self) -> &str {
        self.text("prefix").unwrap_or(".")
    }

    pub fn packname(&self) -> &str {
        self.text("packname").unwrap_or("Toxic-MD")
    }

    /// Anything other than `private` is treated as public.
    pub fn mode(&self) -> Mode {
        match self.text("mode") {
            Some(m) if m.eq_ignore_ascii_case("private") => Mode::Private,
            _ => Mode::Public,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Add every default key missing from `doc`. Existing values win.
///
/// Returns the number of keys added.
pub fn backfill_defaults(doc: &mut SettingsDocument) -> usize {
    let mut added = 0;
    for (key, value) in DEFAULT_SETTINGS {
        if !doc.contains_key(*key) {
            doc.insert((*key).to_string(), Value::String((*value).to_string()));
            added += 1;
        }
    }
    added
}

// ---------------------------------------------------------------------------
// Group settings
// ---------------------------------------------------------------------------

/// Raw on-disk shape of the group settings document.
pub type GroupSettingsDocument = BTreeMap<String, GroupSettings>;

/// Per-group settings record.
///
/// Keys outside the known set are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    #[serde(default, deserialize_with = "lenient_bool")]
    pub antidelete: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub gcpresence: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub events: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub antidemote: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub antipromote: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl GroupSettings {
    /// The record synthesized for a group with no stored entry.
    pub fn inherit(global: &Settings) -> Self {
        Self {
            antidelete: global.flag("antidelete"),
            gcpresence: false,
            events: false,
            antidemote: false,
            antipromote: false,
            extra: BTreeMap::new(),
        }
    }

    /// Set one key. Known keys only accept booleans.
    pub fn set(&mut self, key: &str, value: SettingValue) -> StoreResult<()> {
        let slot = match key {
            "antidelete" => &mut self.antidelete,
            "gcpresence" => &mut self.gcpresence,
            "events" => &mut self.events,
            "antidemote" => &mut self.antidemote,
            "antipromote" => &mut self.antipromote,
            other => {
                self.extra.insert(other.to_string(), value.to_json());
                return Ok(());
            }
        };
        *slot = value.as_bool().ok_or_else(|| {
            StoreError::InvalidArgument(format!("group setting `{key}` expects a boolean, got `{value}`"))
        })?;
        Ok(())
    }
}

/// Accept `true`, `"true"`, `false` and `"false"`.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) if s == "true" => Ok(true),
        Value::String(s) if s == "false" => Ok(false),
        Value::Null => Ok(false),
        other => Err(serde::de::Error::custom(format!(
            "expected boolean, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_booleans_decode_to_booleans() {
        let doc: SettingsDocument =
            serde_json::from_value(json!({"autoview": "true", "anticall": "false", "prefix": "!"}))
                .unwrap();
        let settings = Settings::from_document(&doc);

        assert_eq!(settings.get("autoview"), Some(&SettingValue::Bool(true)));
        assert!(!settings.flag("anticall"));
        assert_eq!(settings.prefix(), "!");
    }

    #[test]
    fn raw_json_booleans_are_accepted() {
        let doc: SettingsDocument = serde_json::from_value(json!({"autobio": true})).unwrap();
        assert!(Settings::from_document(&doc).flag("autobio"));
    }

    #[test]
    fn encoding_writes_booleans_as_strings() {
        let mut settings = Settings::empty();
        settings.set("antiedit", true);
        settings.set("mode", "private");

        let doc = settings.to_document();
        assert_eq!(doc["antiedit"], json!("true"));
        assert_eq!(doc["mode"], json!("private"));
        assert_eq!(settings.mode(), Mode::Private);
    }

    #[test]
    fn defaults_contain_full_key_set() {
        let settings = Settings::defaults();
        assert_eq!(settings.len(), DEFAULT_SETTINGS.len());
        assert!(settings.flag("autoview"));
        assert!(settings.flag("startmessage"));
        assert_eq!(settings.text("antilink"), Some("off"));
        assert_eq!(settings.mode(), Mode::Public);
    }

    #[test]
    fn backfill_keeps_existing_values() {
        let mut doc: SettingsDocument =
            serde_json::from_value(json!({"prefix": "#", "custom": "x"})).unwrap();
        let added = backfill_defaults(&mut doc);

        assert_eq!(added, DEFAULT_SETTINGS.len() - 1);
        assert_eq!(doc["prefix"], json!("#"));
        assert_eq!(doc["custom"], json!("x"));
        assert_eq!(doc["mode"], json!("public"));
    }

    #[test]
    fn group_record_inherits_antidelete() {
        let mut global = Settings::defaults();
        assert!(!GroupSettings::inherit(&global).antidelete);

        global.set("antidelete", true);
        let record = GroupSettings::inherit(&global);
        assert!(record.antidelete);
        assert!(!record.events);
    }

    #[test]
    fn group_record_accepts_string_booleans_and_keeps_unknown_keys() {
        let record: GroupSettings = serde_json::from_value(
            json!({"antidelete": "true", "events": false, "welcome": "hi"}),
        )
        .unwrap();
        assert!(record.antidelete);
        assert!(!record.gcpresence);
        assert_eq!(record.extra["welcome"], json!("hi"));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["welcome"], json!("hi"));
        assert_eq!(back["antidelete"], json!(true));
    }

    #[test]
    fn group_set_rejects_non_boolean_for_known_key() {
        let mut record = GroupSettings::inherit(&Settings::empty());
        assert!(record.set("events", SettingValue::from("yes")).is_err());
        record.set("events", true.into()).unwrap();
        assert!(record.events);
        record.set("goodbye", "bye".into()).unwrap();
        assert_eq!(record.extra["goodbye"], json!("bye"));
    }
}
