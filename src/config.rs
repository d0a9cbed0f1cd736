use crate::observability::{env_value, parse_bool};
use crate::selector::{is_valid_name, DEFAULT_NAMESPACE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Namespace for specs registered without one and for bare dependency names.
    pub default_namespace: String,
    /// Whether `Session::replay` appends its output to the store.
    pub persist_replays: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            persist_replays: true,
        }
    }
}

pub const DEFAULT_NAMESPACE_VAR: &str = "PITLAB_DEFAULT_NAMESPACE";
pub const PERSIST_REPLAYS_VAR: &str = "PITLAB_PERSIST_REPLAYS";

/// Session settings from the environment. Invalid values keep the defaults.
pub fn session_config_from_env() -> SessionConfig {
    let mut config = SessionConfig::default();

    if let Some(namespace) = env_value(DEFAULT_NAMESPACE_VAR).filter(|ns| is_valid_name(ns)) {
        config.default_namespace = namespace;
    }
    if let Some(persist) = env_value(PERSIST_REPLAYS_VAR).as_deref().and_then(parse_bool) {
        config.persist_replays = persist;
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env(namespace: Option<&str>, persist: Option<&str>) -> SessionConfig {
        let _guard = env_lock().lock().expect("env lock should not be poisoned");
        for (key, value) in [
            (DEFAULT_NAMESPACE_VAR, namespace),
            (PERSIST_REPLAYS_VAR, persist),
        ] {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        let config = session_config_from_env();
        env::remove_var(DEFAULT_NAMESPACE_VAR);
        env::remove_var(PERSIST_REPLAYS_VAR);
        config
    }

    #[test]
    fn defaults_when_env_missing() {
        assert_eq!(with_env(None, None), SessionConfig::default());
    }

    #[test]
    fn reads_namespace_and_persist_flag() {
        let config = with_env(Some("bank"), Some("off"));
        assert_eq!(config.default_namespace, "bank");
        assert!(!config.persist_replays);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = with_env(Some("_bad name"), Some("sometimes"));
        assert_eq!(config, SessionConfig::default());
    }
}
