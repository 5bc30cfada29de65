use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

use super::backend::DetectorBackend;
use super::backends::{CpuBackend, StubBackend};

/// Builds a fresh backend instance for one session.
pub type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Registry of named detector backend factories.
///
/// Backends take `&mut self` and carry per-stream state, so sessions never
/// share an instance: every session asks the registry for a new one.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in backends, defaulting to `settings.backend`.
    pub fn with_builtin(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>));

        let motion_class = settings.detect_classes.first().copied().unwrap_or(0);
        registry.register("cpu", move || {
            Ok(Box::new(CpuBackend::new(motion_class)) as Box<dyn DetectorBackend>)
        });

        #[cfg(feature = "backend-tract")]
        {
            let model_path = settings.model_path.clone();
            let input_size = settings.input_size;
            let iou = settings.iou;
            registry.register("tract", move || {
                let path = model_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("tract backend requires detector.model_path"))?;
                let backend = super::backends::TractBackend::new(path, input_size)?.with_iou(iou);
                Ok(Box::new(backend) as Box<dyn DetectorBackend>)
            });
        }

        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register a factory. The first registered factory becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// Create a new instance of the named backend.
    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        factory()
    }

    /// Create a new instance of the default backend.
    pub fn create_default(&self) -> Result<Box<dyn DetectorBackend>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.create(name)
    }

    /// List registered backends, sorted by name.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
