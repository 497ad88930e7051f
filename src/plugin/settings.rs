//! Plugin settings: defaults, merge and store injection.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::keycloak::KeycloakConfig;
use crate::session::{SessionSettings, SessionStore};
use crate::{Error, Result};

/// Session secret used when none is configured
pub const DEFAULT_SESSION_SECRET: &str = "kc_secret";

const SESSION: &str = "session";
const KEYCLOAK_CONFIG: &str = "keycloakConfig";

/// `{ session: { secret: "kc_secret" }, keycloakConfig: {} }`
#[must_use]
pub fn default_settings() -> Value {
    json!({
        "session": { "secret": DEFAULT_SESSION_SECRET },
        "keycloakConfig": {}
    })
}

/// Right-biased, one-level merge: keys of `overrides` replace keys of
/// `defaults` wholesale.
#[must_use]
pub fn merge_shallow(defaults: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Effective plugin settings.
#[derive(Clone)]
pub struct PluginSettings {
    /// Merged session options, without `store`
    pub session: Map<String, Value>,
    /// Merged Keycloak adapter options
    pub keycloak_config: Map<String, Value>,
    /// Session store shared by the session middleware and the adapter
    pub store: Arc<dyn SessionStore>,
}

impl fmt::Debug for PluginSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSettings")
            .field("session", &self.session)
            .field("keycloak_config", &self.keycloak_config)
            .finish_non_exhaustive()
    }
}

impl PluginSettings {
    /// Merge raw settings over the defaults and inject `store`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the settings, `session` or `keycloakConfig` are
    /// present but not objects.
    pub fn resolve(raw: &Value, store: Arc<dyn SessionStore>) -> Result<Self> {
        let defaults = default_settings();
        let empty = Map::new();

        let user = match raw {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(Error::Config(format!(
                    "keycloak plugin settings must be an object, got {other}"
                )));
            }
        };

        let section = |name: &str| -> Result<Map<String, Value>> {
            let base = defaults
                .get(name)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            match user.get(name) {
                None | Some(Value::Null) => Ok(base),
                Some(Value::Object(overrides)) => Ok(merge_shallow(&base, overrides)),
                Some(other) => Err(Error::Config(format!("'{name}' must be an object, got {other}"))),
            }
        };

        let mut session = section(SESSION)?;
        if session.remove("store").is_some() {
            debug!("Ignoring configured session store; the plugin supplies its own");
        }

        Ok(Self {
            session,
            keycloak_config: section(KEYCLOAK_CONFIG)?,
            store,
        })
    }

    /// Typed session options
    pub fn session_settings(&self) -> Result<SessionSettings> {
        SessionSettings::from_json(Value::Object(self.session.clone()))
    }

    /// Typed Keycloak adapter options
    pub fn keycloak(&self) -> Result<KeycloakConfig> {
        KeycloakConfig::from_json(Value::Object(self.keycloak_config.clone()))
    }

    /// Settings for logging: secrets masked, store shown by name.
    #[must_use]
    pub fn redacted(&self) -> Value {
        let mut session = self.session.clone();
        if session.contains_key("secret") {
            session.insert("secret".to_string(), json!("***"));
        }
        session.insert("store".to_string(), json!("memory"));

        let mut keycloak = self.keycloak_config.clone();
        if let Some(Value::Object(credentials)) = keycloak.get_mut("credentials") {
            if credentials.contains_key("secret") {
                credentials.insert("secret".to_string(), json!("***"));
            }
        }

        json!({ "session": session, "keycloakConfig": keycloak })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemorySessionStore;
    use pretty_assertions::assert_eq;

    fn store() -> Arc<dyn SessionStore> {
        Arc::new(InMemorySessionStore::new())
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn merge_is_right_biased_and_shallow() {
        let merged = merge_shallow(&object(json!({ "a": 1, "b": 2 })), &object(json!({ "b": 3 })));
        assert_eq!(Value::Object(merged), json!({ "a": 1, "b": 3 }));

        // nested objects are replaced, not merged
        let merged = merge_shallow(
            &object(json!({ "cookie": { "secure": true, "path": "/" } })),
            &object(json!({ "cookie": { "secure": false } })),
        );
        assert_eq!(Value::Object(merged), json!({ "cookie": { "secure": false } }));
    }

    #[test]
    fn defaults_without_overrides() {
        // GIVEN: no plugin settings at all
        let injected = store();
        let settings = PluginSettings::resolve(&Value::Null, Arc::clone(&injected)).unwrap();

        // THEN: the session config is exactly the default secret plus the store
        assert_eq!(Value::Object(settings.session.clone()), json!({ "secret": "kc_secret" }));
        assert!(Arc::ptr_eq(&settings.store, &injected));
        assert!(settings.keycloak_config.is_empty());
    }

    #[test]
    fn user_values_override_per_key() {
        let raw = json!({
            "session": { "secret": "mine", "rolling": true },
            "keycloakConfig": { "realm": "demo" }
        });
        let settings = PluginSettings::resolve(&raw, store()).unwrap();

        assert_eq!(
            Value::Object(settings.session),
            json!({ "secret": "mine", "rolling": true })
        );
        assert_eq!(Value::Object(settings.keycloak_config), json!({ "realm": "demo" }));
    }

    #[test]
    fn user_store_is_replaced_by_injected_store() {
        let raw = json!({ "session": { "store": "redis://elsewhere" } });
        let settings = PluginSettings::resolve(&raw, store()).unwrap();

        assert!(!settings.session.contains_key("store"));
        assert_eq!(settings.session["secret"], "kc_secret");
    }

    #[test]
    fn non_object_sections_are_config_errors() {
        let err = PluginSettings::resolve(&json!({ "session": "nope" }), store()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = PluginSettings::resolve(&json!(["x"]), store()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn redacted_hides_secrets() {
        let raw = json!({
            "session": { "secret": "hush" },
            "keycloakConfig": { "credentials": { "secret": "client-hush" } }
        });
        let shown = PluginSettings::resolve(&raw, store()).unwrap().redacted().to_string();

        assert!(!shown.contains("hush"));
        assert!(shown.contains("\"store\":\"memory\""));
    }

    #[test]
    fn typed_views_parse_merged_maps() {
        let settings = PluginSettings::resolve(&Value::Null, store()).unwrap();
        let session = settings.session_settings().unwrap();
        assert_eq!(session.secret.keys(), vec!["kc_secret".to_string()]);

        // the empty default keycloakConfig cannot build an adapter
        assert!(settings.keycloak().is_err());
    }
}
