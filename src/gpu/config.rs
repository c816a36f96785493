use std::fmt;
use std::sync::Arc;

/// Severity of a validation message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Receives validation and debug-layer messages from a device.
pub trait DiagnosticSink: Send + Sync {
    fn message(&self, severity: Severity, text: &str);
}

/// Forwards diagnostics to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn message(&self, severity: Severity, text: &str) {
        match severity {
            Severity::Info => log::info!("{}", text),
            Severity::Warning => log::warn!("{}", text),
            Severity::Error => log::error!("{}", text),
        }
    }
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterPreference {
    Dedicated,
    Integrated,
    /// Software rasterizer / CPU implementation.
    Software,
    #[default]
    Any,
}

/// Construction-time device settings.
#[derive(Clone)]
pub struct DeviceConfig {
    /// Enable native debug layers and host-side hazard checks.
    pub validation: bool,
    pub adapter: AdapterPreference,
    /// Index into the adapters matching `adapter`.
    pub device_index: usize,
    /// Upper bound on live device memory in bytes. `None` is unbounded.
    pub memory_budget: Option<u64>,
    /// Request image support where the backend can provide it.
    pub images: bool,
    /// Where validation messages go. Defaults to [`LogSink`].
    pub diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            validation: false,
            adapter: AdapterPreference::Any,
            device_index: 0,
            memory_budget: None,
            images: true,
            diagnostics: None,
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("validation", &self.validation)
            .field("adapter", &self.adapter)
            .field("device_index", &self.device_index)
            .field("memory_budget", &self.memory_budget)
            .field("images", &self.images)
            .field("diagnostics", &self.diagnostics.is_some())
            .finish()
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

impl DeviceConfig {
    /// Defaults, with `DASHI_VALIDATION=1` turning on validation and
    /// `DASHI_FORCE_SOFTWARE=1` asking for a software adapter.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.validation = env_flag("DASHI_VALIDATION");
        if env_flag("DASHI_FORCE_SOFTWARE") {
            cfg.adapter = AdapterPreference::Software;
        }
        cfg
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub(crate) fn diagnostic_sink(&self) -> Arc<dyn DiagnosticSink> {
        self.diagnostics
            .clone()
            .unwrap_or_else(|| Arc::new(LogSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(Severity, String)>>);

    impl DiagnosticSink for Collect {
        fn message(&self, severity: Severity, text: &str) {
            self.0.lock().unwrap().push((severity, text.to_string()));
        }
    }

    #[test]
    fn custom_sink_is_used() {
        let sink = Arc::new(Collect::default());
        let cfg = DeviceConfig::default().with_diagnostics(sink.clone());
        cfg.diagnostic_sink().message(Severity::Warning, "hazard");
        assert_eq!(
            sink.0.lock().unwrap()[0],
            (Severity::Warning, "hazard".to_string())
        );
    }

    #[test]
    fn builders() {
        let cfg = DeviceConfig::default()
            .with_validation(true)
            .with_memory_budget(1024);
        assert!(cfg.validation);
        assert_eq!(cfg.memory_budget, Some(1024));
        assert!(format!("{cfg:?}").contains("validation: true"));
    }
}
