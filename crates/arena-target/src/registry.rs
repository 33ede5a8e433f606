//! Registry of standard gyms.
//!
//! `StandardGym(name)` references resolve to a fixed custom gym registered
//! under that name.

use crate::error::TargetError;
use crate::target::TargetRef;
use std::collections::HashMap;

/// Maps standard gym names to concrete targets.
#[derive(Debug, Clone)]
pub struct GymRegistry {
    gyms: HashMap<String, TargetRef>,
}

impl Default for GymRegistry {
    /// The built-in gyms: `browser` and `desktop`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("browser", TargetRef::local_image("arena/browser-gym:latest"));
        registry.register("desktop", TargetRef::local_image("arena/desktop-gym:latest"));
        registry
    }
}

impl GymRegistry {
    /// A registry with no gyms.
    pub fn empty() -> Self {
        Self {
            gyms: HashMap::new(),
        }
    }

    /// Register (or replace) a gym name.
    ///
    /// Registering a `StandardGym` alias is rejected at resolve time, not here.
    pub fn register(&mut self, name: impl Into<String>, target: TargetRef) -> &mut Self {
        let name = name.into();
        tracing::debug!(gym = %name, target = %target, "Registering gym");
        self.gyms.insert(name, target);
        self
    }

    /// Registered gym names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.gyms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a reference to a `CustomGym`.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::Configuration`] for unknown names or names that
    /// point at another standard gym.
    pub fn resolve(&self, target: &TargetRef) -> Result<TargetRef, TargetError> {
        match target {
            TargetRef::CustomGym { .. } => Ok(target.clone()),
            TargetRef::StandardGym(name) => match self.gyms.get(name) {
                Some(resolved @ TargetRef::CustomGym { .. }) => Ok(resolved.clone()),
                Some(TargetRef::StandardGym(alias)) => Err(TargetError::Configuration(format!(
                    "gym '{name}' is registered as an alias of '{alias}'; register a custom gym instead"
                ))),
                None => Err(TargetError::Configuration(format!(
                    "unknown standard gym '{name}' (known: {})",
                    self.names().join(", ")
                ))),
            },
        }
    }
}
