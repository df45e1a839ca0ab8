use ::config::{Config, ConfigError};

use crate::error::Error;

// Looks up `{name}.{key}` first and falls back to `{key}` when the namespaced
// key is absent. An empty name skips the namespaced lookup.
fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        match getter(config, &format!("{name}.{key}")) {
            Err(ConfigError::NotFound(_)) => getter(config, key),
            result => result,
        }
    }
}

// Like get_namespaced_value, but a missing key yields `default`. A key that is
// present but malformed is still an error.
fn get_namespaced_value_or<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    default: T,
    getter: F,
) -> Result<T, Error>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    match get_namespaced_value(config, name, key, getter) {
        Ok(value) => Ok(value),
        Err(ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn get_namespaced_usize_or(
    config: &Config,
    name: &str,
    key: &str,
    default: usize,
) -> Result<usize, Error> {
    get_namespaced_value_or(config, name, key, default, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_bool_or(
    config: &Config,
    name: &str,
    key: &str,
    default: bool,
) -> Result<bool, Error> {
    get_namespaced_value_or(config, name, key, default, Config::get_bool)
}
