//! Keyed settings dictionaries handed to the engine when configuring objects

use std::collections::BTreeMap;

/// A single settings value. The engine only understands strings, integers and booleans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// Ordered key/value settings for an engine object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, SettingValue>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.values
            .insert(key.to_string(), SettingValue::Str(value.into()));
        self
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.values.insert(key.to_string(), SettingValue::Int(value));
        self
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.values.insert(key.to_string(), SettingValue::Bool(value));
        self
    }

    /// Overlay `other` on top of these settings (engine `update` semantics)
    pub fn merge(&mut self, other: &Settings) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
impl Settings {
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(SettingValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(SettingValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(SettingValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_only_match_their_type() {
        let mut settings = Settings::new();
        settings
            .set_string("rate_control", "CBR")
            .set_int("bitrate", 8000)
            .set_bool("lookahead", false);

        assert_eq!(settings.get_str("rate_control"), Some("CBR"));
        assert_eq!(settings.get_int("bitrate"), Some(8000));
        assert_eq!(settings.get_bool("lookahead"), Some(false));
        assert_eq!(settings.get_int("rate_control"), None);
        assert_eq!(settings.get_str("missing"), None);
    }

    #[test]
    fn merge_overwrites_existing_keys() {
        let mut base = Settings::new();
        base.set_int("max_time_sec", 60).set_string("directory", "/a");

        let mut update = Settings::new();
        update.set_int("max_time_sec", 120);
        base.merge(&update);

        assert_eq!(base.get_int("max_time_sec"), Some(120));
        assert_eq!(base.get_str("directory"), Some("/a"));
        assert_eq!(base.len(), 2);
    }
}
