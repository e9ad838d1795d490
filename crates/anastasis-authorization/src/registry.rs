//! Method registry: resolves method names to plugin instances, lazily,
//! with a process-wide cache. Loading fails closed: a method without a
//! configuration section (minimally a cost) is rejected.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::warn;

use anastasis_core::{Amount, AuthorizationMethodConfig};

use crate::command::CommandPlugin;
use crate::file::FilePlugin;
use crate::plugin::AuthorizationPlugin;
use crate::totp::TotpPlugin;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("authorization method `{0}` is not configured")]
    NotConfigured(String),

    #[error("authorization method `{0}` is disabled")]
    Disabled(String),

    #[error("authorization method `{0}` is not supported by this build")]
    Unsupported(String),

    #[error("authorization method `{0}` is missing its delivery command")]
    MissingCommand(String),
}

pub struct PluginRegistry {
    methods: BTreeMap<String, AuthorizationMethodConfig>,
    cache: Mutex<HashMap<String, Arc<dyn AuthorizationPlugin>>>,
}

impl PluginRegistry {
    pub fn new(methods: BTreeMap<String, AuthorizationMethodConfig>) -> Self {
        Self {
            methods,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `method` to a plugin, instantiating and caching it on
    /// first use.
    pub fn load(&self, method: &str) -> Result<Arc<dyn AuthorizationPlugin>, LoadError> {
        {
            let cache = self.cache.lock().expect("registry cache poisoned");
            if let Some(p) = cache.get(method) {
                return Ok(Arc::clone(p));
            }
        }
        let mc = self
            .methods
            .get(method)
            .ok_or_else(|| LoadError::NotConfigured(method.to_string()))?;
        if !mc.enabled {
            return Err(LoadError::Disabled(method.to_string()));
        }
        let plugin: Arc<dyn AuthorizationPlugin> = match method {
            "file" => Arc::new(FilePlugin::new(mc.cost.clone())),
            "totp" => Arc::new(TotpPlugin::new(mc.cost.clone(), mc.totp_allowed_drift_steps)),
            m @ ("email" | "sms") => {
                let command = mc
                    .command
                    .clone()
                    .ok_or_else(|| LoadError::MissingCommand(m.to_string()))?;
                Arc::new(CommandPlugin::new(m, mc.cost.clone(), command))
            }
            other => return Err(LoadError::Unsupported(other.to_string())),
        };
        let mut cache = self.cache.lock().expect("registry cache poisoned");
        Ok(Arc::clone(
            cache
                .entry(method.to_string())
                .or_insert(plugin),
        ))
    }

    /// Whether `method` could serve truths (used at upload time).
    pub fn supports(&self, method: &str) -> bool {
        self.load(method).is_ok()
    }

    /// Enabled methods with their cost, for the `/config` listing.
    /// Methods that fail to load are skipped with a warning rather than
    /// advertised.
    pub fn enabled_methods(&self) -> Vec<(String, Amount)> {
        let mut out = Vec::new();
        for (name, mc) in &self.methods {
            if !mc.enabled {
                continue;
            }
            match self.load(name) {
                Ok(plugin) => out.push((name.clone(), plugin.properties().cost.clone())),
                Err(e) => warn!(method = %name, error = %e,
                                "enabled authorization method failed to load"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method_config(enabled: bool, cost: &str, command: Option<&str>) -> AuthorizationMethodConfig {
        AuthorizationMethodConfig {
            enabled,
            cost: cost.parse().unwrap(),
            command: command.map(String::from),
            totp_allowed_drift_steps: 2,
        }
    }

    fn registry() -> PluginRegistry {
        let mut methods = BTreeMap::new();
        methods.insert("file".to_string(), method_config(true, "EUR:1", None));
        methods.insert(
            "sms".to_string(),
            method_config(true, "EUR:2", Some("cat > /dev/null")),
        );
        methods.insert("email".to_string(), method_config(true, "EUR:1", None));
        methods.insert("totp".to_string(), method_config(false, "EUR:0", None));
        methods.insert("post".to_string(), method_config(true, "EUR:3", None));
        PluginRegistry::new(methods)
    }

    #[test]
    fn loads_and_caches_supported_methods() {
        let r = registry();
        let a = r.load("file").unwrap();
        let b = r.load("file").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.method(), "file");
        assert_eq!(r.load("sms").unwrap().method(), "sms");
    }

    #[test]
    fn fails_closed() {
        let r = registry();
        assert!(matches!(r.load("iban"), Err(LoadError::NotConfigured(_))));
        assert!(matches!(r.load("totp"), Err(LoadError::Disabled(_))));
        // Command-backed method without a delivery command.
        assert!(matches!(r.load("email"), Err(LoadError::MissingCommand(_))));
        // Configured but not built in.
        assert!(matches!(r.load("post"), Err(LoadError::Unsupported(_))));
    }

    #[test]
    fn config_listing_skips_broken_methods() {
        let r = registry();
        let methods = r.enabled_methods();
        let names: Vec<&str> = methods.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["file", "sms"]);
    }
}
