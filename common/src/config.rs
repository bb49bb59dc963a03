use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const THING_ID_MAX: usize = 49;
pub const THING_NAME_MAX: usize = 49;
pub const TB_SERVER_MAX: usize = 99;
pub const TB_TOKEN_MAX: usize = 33;

/// One user-editable provisioning field: persisted key, portal label,
/// and the compile-time length bound shared with the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub max_len: usize,
}

/// The persisted configuration record behind a firmware variant.
///
/// Values are bounded: `set_value` truncates rather than overflowing
/// storage, and `sanitize` re-applies the bounds to whatever came off
/// disk.
pub trait DeviceConfig: Clone + Default + Serialize + DeserializeOwned {
    /// Portal-editable fields, in display order.
    fn fields() -> &'static [FieldSpec];

    fn value(&self, key: &str) -> Option<&str>;

    /// Sets a field by key, truncated to its bound. Unknown keys are ignored.
    fn set_value(&mut self, key: &str, value: &str);

    /// Fills identity-derived defaults for fields still empty after load.
    fn apply_identity_default(&mut self, device_id: &str);

    /// Cross-field fallback rules applied after a portal submission.
    fn finalize(&mut self);

    fn sanitize(&mut self) {
        for spec in Self::fields() {
            if let Some(value) = self.value(spec.key) {
                if value.len() > spec.max_len {
                    let bounded = truncated(value, spec.max_len);
                    self.set_value(spec.key, &bounded);
                }
            }
        }
    }
}

/// Truncates to at most `max_len` bytes without splitting a character.
pub fn truncated(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// Web of Things variant: thing identity plus display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebThingConfig {
    #[serde(default)]
    pub thing_id: String,
    #[serde(default)]
    pub thing_name: String,
}

impl DeviceConfig for WebThingConfig {
    fn fields() -> &'static [FieldSpec] {
        &[
            FieldSpec {
                key: "thing_id",
                label: "Thing Id",
                max_len: THING_ID_MAX,
            },
            FieldSpec {
                key: "thing_name",
                label: "Thing Display Name",
                max_len: THING_NAME_MAX,
            },
        ]
    }

    fn value(&self, key: &str) -> Option<&str> {
        match key {
            "thing_id" => Some(&self.thing_id),
            "thing_name" => Some(&self.thing_name),
            _ => None,
        }
    }

    fn set_value(&mut self, key: &str, value: &str) {
        match key {
            "thing_id" => self.thing_id = truncated(value, THING_ID_MAX),
            "thing_name" => self.thing_name = truncated(value, THING_NAME_MAX),
            _ => {}
        }
    }

    fn apply_identity_default(&mut self, device_id: &str) {
        if self.thing_id.is_empty() {
            self.thing_id = truncated(device_id, THING_ID_MAX);
        }
        if self.thing_name.is_empty() {
            self.thing_name = self.thing_id.clone();
        }
    }

    fn finalize(&mut self) {
        // An empty display name inherits the identity field.
        if self.thing_name.is_empty() {
            self.thing_name = self.thing_id.clone();
        }
    }
}

/// ThingsBoard variant: platform endpoint plus device access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingsBoardConfig {
    #[serde(rename = "tb_server", default)]
    pub server: String,
    #[serde(rename = "tb_token", default)]
    pub token: String,
}

impl Default for ThingsBoardConfig {
    fn default() -> Self {
        Self {
            server: "demo.thingsboard.io".to_string(),
            token: String::new(),
        }
    }
}

impl DeviceConfig for ThingsBoardConfig {
    fn fields() -> &'static [FieldSpec] {
        &[
            FieldSpec {
                key: "tb_server",
                label: "ThingsBoard Server",
                max_len: TB_SERVER_MAX,
            },
            FieldSpec {
                key: "tb_token",
                label: "Access Token",
                max_len: TB_TOKEN_MAX,
            },
        ]
    }

    fn value(&self, key: &str) -> Option<&str> {
        match key {
            "tb_server" => Some(&self.server),
            "tb_token" => Some(&self.token),
            _ => None,
        }
    }

    fn set_value(&mut self, key: &str, value: &str) {
        match key {
            "tb_server" => self.server = truncated(value, TB_SERVER_MAX),
            "tb_token" => self.token = truncated(value, TB_TOKEN_MAX),
            _ => {}
        }
    }

    fn apply_identity_default(&mut self, _device_id: &str) {}

    fn finalize(&mut self) {
        if self.server.is_empty() {
            self.server = Self::default().server;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn set_value_truncates_to_exact_bound() {
        let mut config = WebThingConfig::default();
        config.set_value("thing_id", &"x".repeat(120));

        assert_eq!(config.thing_id.len(), THING_ID_MAX);
        assert_eq!(config.thing_id, "x".repeat(THING_ID_MAX));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; a byte-level cut at 3 would split it.
        let bounded = truncated("aéé", 3);
        assert_eq!(bounded, "aé");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = WebThingConfig::default();
        config.set_value("bogus", "value");
        assert_eq!(config, WebThingConfig::default());
    }

    #[test]
    fn empty_display_name_falls_back_to_identity() {
        let mut config = WebThingConfig {
            thing_id: "dev-42".to_string(),
            thing_name: String::new(),
        };
        config.finalize();

        assert_eq!(config.thing_name, "dev-42");
    }

    #[test]
    fn identity_default_fills_empty_fields_only() {
        let mut config = WebThingConfig {
            thing_id: String::new(),
            thing_name: "Front Porch".to_string(),
        };
        config.apply_identity_default("Relay-a1b2c3");

        assert_eq!(config.thing_id, "Relay-a1b2c3");
        assert_eq!(config.thing_name, "Front Porch");
    }

    #[test]
    fn sanitize_bounds_oversized_stored_values() {
        let mut config = ThingsBoardConfig {
            server: "s".repeat(200),
            token: "t".repeat(40),
        };
        config.sanitize();

        assert_eq!(config.server.len(), TB_SERVER_MAX);
        assert_eq!(config.token.len(), TB_TOKEN_MAX);
    }

    #[test]
    fn thingsboard_record_uses_tb_prefixed_keys() {
        let config = ThingsBoardConfig {
            server: "tb.example.net".to_string(),
            token: "secret".to_string(),
        };
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["tb_server"], "tb.example.net");
        assert_eq!(json["tb_token"], "secret");
    }

    #[test]
    fn thingsboard_server_defaults_when_submitted_empty() {
        let mut config = ThingsBoardConfig {
            server: String::new(),
            token: "secret".to_string(),
        };
        config.finalize();

        assert_eq!(config.server, "demo.thingsboard.io");
        assert_eq!(config.token, "secret");
    }
}
