use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::settings::ForqSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "forq.toml";
pub const ENV_CONFIG_KEY: &str = "FORQ_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "--config parameter".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY)
        && !env_path.is_empty()
    {
        return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "not found".to_string())
}

/// Load settings from TOML with `FORQ_*` environment overrides merged on
/// top. A missing config file is not an error: the defaults plus the
/// environment are a complete configuration.
pub fn load_settings(config_path: Option<&str>) -> Result<ForqSettings> {
    dotenvy::dotenv().ok();

    let (path, _) = resolve_config_source(config_path);
    let base = match path {
        Some(path) => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {path}"))?;
            let toml_value: toml::Value = toml::from_str(&payload)
                .with_context(|| format!("failed to parse TOML at {path}"))?;
            let json_value =
                serde_json::to_value(toml_value).context("failed to convert TOML to JSON")?;
            normalize_toml_payload(json_value)?
        }
        None => Value::Object(Map::new()),
    };

    let merged = deep_merge(base, env_overrides()?);
    let settings: ForqSettings = serde_json::from_value(merged).context("invalid forq config")?;
    Ok(settings)
}

fn normalize_toml_payload(mut payload: Value) -> Result<Value> {
    if let Value::Object(mut map) = payload {
        if let Some(forq_value) = map.remove("forq") {
            payload = forq_value;
        } else {
            payload = Value::Object(map);
        }
    }

    match payload {
        Value::Object(map) => Ok(Value::Object(map)),
        _ => Err(anyhow::anyhow!("forq config must be a TOML table")),
    }
}

fn env_overrides() -> Result<Value> {
    let mut payload = Map::new();

    set_env_string(&mut payload, "redis_dsn", "FORQ_REDIS_DSN");
    set_env_string(&mut payload, "namespace", "FORQ_NAMESPACE");
    set_env_bool(&mut payload, "blocking", "FORQ_BLOCKING")?;
    set_env_float(&mut payload, "interval", "FORQ_INTERVAL")?;
    set_env_int(&mut payload, "timeout", "FORQ_TIMEOUT")?;
    set_env_int(&mut payload, "memory_limit", "FORQ_MEMORY_LIMIT")?;
    set_env_int(&mut payload, "expiry_time", "FORQ_EXPIRY_TIME")?;
    set_env_int(&mut payload, "retry_threshold", "FORQ_RETRY_THRESHOLD")?;
    set_env_bool(&mut payload, "dedicated_lock", "FORQ_DEDICATED_LOCK")?;
    set_env_string(&mut payload, "worker_exec", "FORQ_WORKER_EXEC");

    if let Ok(value) = std::env::var("FORQ_QUEUES")
        && !value.is_empty()
    {
        let queues: Vec<Value> = value
            .split(',')
            .map(str::trim)
            .filter(|queue| !queue.is_empty())
            .map(|queue| Value::String(queue.to_string()))
            .collect();
        payload.insert("queues".to_string(), Value::Array(queues));
    }

    Ok(Value::Object(payload))
}

fn set_env_string(map: &mut Map<String, Value>, key: &str, env: &str) {
    if let Ok(value) = std::env::var(env)
        && !value.is_empty()
    {
        map.insert(key.to_string(), Value::String(value));
    }
}

fn set_env_int(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: i64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(key.to_string(), Value::Number(parsed.into()));
    }
    Ok(())
}

fn set_env_float(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed: f64 = value
            .parse()
            .with_context(|| format!("Invalid {env} value: {value}"))?;
        map.insert(
            key.to_string(),
            Value::Number(
                serde_json::Number::from_f64(parsed)
                    .ok_or_else(|| anyhow::anyhow!("Invalid {env} value: {value}"))?,
            ),
        );
    }
    Ok(())
}

fn set_env_bool(map: &mut Map<String, Value>, key: &str, env: &str) -> Result<()> {
    if let Ok(value) = std::env::var(env) {
        if value.is_empty() {
            return Ok(());
        }
        let parsed = match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => anyhow::bail!("Invalid {env} value: {value}"),
        };
        map.insert(key.to_string(), Value::Bool(parsed));
    }
    Ok(())
}

fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                let entry = base_map.remove(&key);
                let merged = match entry {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use uuid::Uuid;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    struct EnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        prev: Vec<(&'static str, Option<String>)>,
    }

    #[allow(unsafe_code)] // env var manipulation in tests
    impl EnvGuard {
        fn set_many(pairs: &[(&'static str, &str)]) -> Self {
            let lock = env_lock().lock().unwrap();
            let mut prev = Vec::with_capacity(pairs.len());
            for (key, value) in pairs {
                prev.push((*key, std::env::var(key).ok()));
                unsafe {
                    std::env::set_var(key, value);
                }
            }
            Self { _lock: lock, prev }
        }
    }

    #[allow(unsafe_code)]
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, prev) in self.prev.drain(..) {
                if let Some(value) = prev {
                    unsafe {
                        std::env::set_var(key, value);
                    }
                } else {
                    unsafe {
                        std::env::remove_var(key);
                    }
                }
            }
        }
    }

    #[test]
    fn resolve_config_source_prefers_explicit_path() {
        let (path, source) = resolve_config_source(Some("custom.toml"));
        assert_eq!(path, Some("custom.toml".to_string()));
        assert!(source.contains("--config"));
    }

    #[test]
    fn load_settings_merges_env_over_toml() {
        let tmp_path = std::env::temp_dir().join(format!("forq-test-{}.toml", Uuid::new_v4()));
        let payload = r#"
[forq]
interval = 2.5
queues = ["mail", "video"]
"#;
        fs::write(&tmp_path, payload).unwrap();
        let _guard = EnvGuard::set_many(&[
            ("FORQ_QUEUES", "reports,*"),
            ("FORQ_MEMORY_LIMIT", "512"),
            ("FORQ_BLOCKING", "off"),
        ]);
        let settings = load_settings(Some(tmp_path.to_str().unwrap())).unwrap();
        assert_eq!(settings.interval, 2.5);
        assert_eq!(settings.queues, vec!["reports", "*"]);
        assert_eq!(settings.memory_limit, 512);
        assert!(!settings.blocking);
        let _ = fs::remove_file(&tmp_path);
    }

    #[test]
    fn load_settings_without_file_uses_defaults() {
        let _guard = EnvGuard::set_many(&[("FORQ_CONFIG", "")]);
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.retry_threshold, 3);
        assert!(settings.blocking);
    }
}
