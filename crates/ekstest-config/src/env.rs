//! `EKSTEST_*` environment overrides
//!
//! Top-level scalar and list fields map to `EKSTEST_<UPPER_SNAKE>`, add-on
//! fields to `EKSTEST_ALB_<UPPER_SNAKE>`. The override is typed by the
//! field's current JSON shape, so `"true"`, `"3"`, `"0.5"` and `"a,b"` land
//! as a bool, an integer, a float and a list respectively.

use ekstest_common::{Error, Result};
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::config::Config;

/// Prefix of top-level overrides
pub const ENV_PREFIX: &str = "EKSTEST_";

/// Prefix of add-on overrides
pub const ENV_ALB_PREFIX: &str = "EKSTEST_ALB_";

const ALB_KEY: &str = "alb-ingress-controller";
const STATE_KEY: &str = "cluster-state";

/// Apply overrides from the process environment
pub fn update_from_environment(cfg: &mut Config) -> Result<()> {
    update_from_vars(cfg, |name| std::env::var(name).ok())
}

/// Apply overrides from an arbitrary lookup
pub fn update_from_vars<F>(cfg: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let mut doc = serde_json::to_value(&*cfg)?;
    let Some(root) = doc.as_object_mut() else {
        return Err(Error::internal_with_context("env", "config is not an object"));
    };

    let mut changed = apply_section(root, ENV_PREFIX, &[ALB_KEY, STATE_KEY], &lookup)?;
    if let Some(Value::Object(alb)) = root.get_mut(ALB_KEY) {
        changed |= apply_section(alb, ENV_ALB_PREFIX, &[], &lookup)?;
    }
    if !changed {
        return Ok(());
    }

    *cfg = serde_json::from_value(doc)
        .map_err(|e| Error::invalid_config("environment", e.to_string()))?;
    Ok(())
}

/// Environment variable name for a kebab-case key
pub fn env_name(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key.to_uppercase().replace('-', "_"))
}

fn apply_section<F>(
    section: &mut Map<String, Value>,
    prefix: &str,
    skip: &[&str],
    lookup: &F,
) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let mut changed = false;
    for (key, value) in section.iter_mut() {
        if skip.contains(&key.as_str()) {
            continue;
        }
        let name = env_name(prefix, key);
        let Some(raw) = lookup(&name) else {
            continue;
        };
        *value = parse_override(key, value, raw.trim())?;
        debug!(variable = %name, "applied environment override");
        changed = true;
    }
    Ok(changed)
}

fn parse_override(key: &str, current: &Value, raw: &str) -> Result<Value> {
    let bad = |what: &str| Error::invalid_config(key, format!("cannot parse {:?} as {}", raw, what));

    match current {
        Value::Bool(_) => raw.parse::<bool>().map(Value::Bool).map_err(|_| bad("bool")),
        Value::Number(n) if n.is_f64() => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| bad("float")),
        Value::Number(_) => raw
            .parse::<i64>()
            .map(|v| Value::Number(v.into()))
            .map_err(|_| bad("integer")),
        Value::Array(_) => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        )),
        Value::Object(_) => Err(Error::invalid_config(key, "nested sections cannot be overridden")),
        Value::String(_) | Value::Null => Ok(Value::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestMode;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_name_is_upper_snake() {
        assert_eq!(env_name(ENV_PREFIX, "worker-node-asg-max"), "EKSTEST_WORKER_NODE_ASG_MAX");
        assert_eq!(env_name(ENV_ALB_PREFIX, "test-expect-qps"), "EKSTEST_ALB_TEST_EXPECT_QPS");
    }

    #[test]
    fn test_typed_overrides() {
        let mut cfg = Config::default();
        update_from_vars(
            &mut cfg,
            vars(&[
                ("EKSTEST_CLUSTER_NAME", "test-ci"),
                ("EKSTEST_WORKER_NODE_ASG_MAX", "3"),
                ("EKSTEST_ENABLE_WORKER_NODE_SSH", "false"),
                ("EKSTEST_ALB_ENABLE", "true"),
                ("EKSTEST_ALB_TEST_MODE", "ingress-test-server"),
                ("EKSTEST_ALB_TEST_EXPECT_QPS", "12.5"),
                ("EKSTEST_ALB_TEST_CLIENTS", "-1"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.cluster_name, "test-ci");
        assert_eq!(cfg.worker_node_asg_max, 3);
        assert!(!cfg.enable_worker_node_ssh);
        assert!(cfg.alb_ingress_controller.enable);
        assert_eq!(cfg.alb_ingress_controller.test_mode, TestMode::IngressTestServer);
        assert_eq!(cfg.alb_ingress_controller.test_expect_qps, 12.5);
        assert_eq!(cfg.alb_ingress_controller.test_clients, -1);
    }

    #[test]
    fn test_unparsable_value_is_invalid_config() {
        let mut cfg = Config::default();
        let err = update_from_vars(&mut cfg, vars(&[("EKSTEST_DOWN", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { ref field, .. } if field == "down"));
    }

    #[test]
    fn test_negative_unsigned_is_invalid_config() {
        let mut cfg = Config::default();
        let err = update_from_vars(&mut cfg, vars(&[("EKSTEST_WORKER_NODE_ASG_MIN", "-2")]))
            .unwrap_err();
        assert_eq!(err.kind(), ekstest_common::ErrorKind::InvalidConfig);
    }

    #[test]
    fn test_state_section_is_not_overridable() {
        let mut cfg = Config::default();
        update_from_vars(&mut cfg, vars(&[("EKSTEST_CLUSTER_STATE", "ACTIVE")])).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
