//! Runtime setting overrides passed at environment priming.

use std::collections::BTreeMap;

use threadgrid_core::RuntimeSettings;

/// Ordered `key=value` overrides applied to the runtime before startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOverrides {
    entries: BTreeMap<String, String>,
}

impl RuntimeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from resolved settings.
    ///
    /// Execution timers are unreliable in some threaded runtime builds;
    /// with `disable_timeouts` the execution and input time limits are
    /// forced off regardless of what the user configured.
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        let mut overrides = Self {
            entries: settings.overrides.clone(),
        };
        if settings.disable_timeouts {
            overrides.set("max_execution_time", "0");
            overrides.set("max_input_time", "-1");
        }
        overrides
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Render as the runtime's `key=value\n` settings block.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sorted_key_value_lines() {
        let mut overrides = RuntimeOverrides::new();
        overrides.set("memory_limit", "128M");
        overrides.set("display_errors", "0");
        assert_eq!(overrides.render(), "display_errors=0\nmemory_limit=128M\n");
    }

    #[test]
    fn empty_overrides_render_nothing() {
        assert_eq!(RuntimeOverrides::new().render(), "");
    }

    #[test]
    fn disable_timeouts_forces_limits_off() {
        let mut settings = RuntimeSettings {
            disable_timeouts: true,
            ..Default::default()
        };
        settings
            .overrides
            .insert("max_execution_time".to_string(), "30".to_string());

        let overrides = RuntimeOverrides::from_settings(&settings);
        assert_eq!(overrides.get("max_execution_time"), Some("0"));
        assert_eq!(overrides.get("max_input_time"), Some("-1"));
        assert_eq!(overrides.len(), 2);
    }

    #[test]
    fn user_overrides_survive_without_disable_timeouts() {
        let mut settings = RuntimeSettings::default();
        settings
            .overrides
            .insert("max_execution_time".to_string(), "30".to_string());

        let overrides = RuntimeOverrides::from_settings(&settings);
        assert_eq!(overrides.get("max_execution_time"), Some("30"));
        assert_eq!(overrides.get("max_input_time"), None);
    }
}
