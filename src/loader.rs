use crate::backend::{BackendHandle, BackendLauncher, ModelInstaller};
use crate::config::{AppConfig, BackendConfig};
use crate::error::InferenceError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Turns a backend configuration into a ready backend.
#[async_trait]
pub trait ModelResolver: Send + Sync {
    async fn resolve(&self, config: &BackendConfig) -> Result<BackendHandle, InferenceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub backend: Option<String>,
    pub model: String,
}

impl ModelKey {
    pub fn new(config: &BackendConfig) -> Self {
        ModelKey {
            backend: config.backend.clone(),
            model: config.model.clone(),
        }
    }

    pub fn to_string(&self) -> String {
        format!(
            "({}@{})",
            self.backend.as_deref().unwrap_or("auto"),
            self.model
        )
    }
}

/// Slot of one model. Concurrent resolves of a cold key wait on the same
/// initialization, so a model is launched at most once at a time.
type LoadSlot = Arc<OnceCell<BackendHandle>>;

/// Loads each model once and hands out the cached backend afterwards.
pub struct ModelLoader {
    launcher: Arc<dyn BackendLauncher>,
    installer: Option<Arc<dyn ModelInstaller>>,
    app_config: AppConfig,
    loaded: DashMap<ModelKey, LoadSlot>,
}

impl ModelLoader {
    pub fn new(launcher: Arc<dyn BackendLauncher>, app_config: AppConfig) -> Self {
        ModelLoader {
            launcher,
            installer: None,
            app_config,
            loaded: DashMap::new(),
        }
    }

    pub fn with_installer(mut self, installer: Arc<dyn ModelInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn loaded_models(&self) -> Vec<ModelKey> {
        self.loaded
            .iter()
            .filter(|e| e.value().initialized())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Forgets every backend loaded for `model`. Returns how many were dropped.
    pub fn unload(&self, model: &str) -> usize {
        let mut dropped = 0;
        self.loaded.retain(|key, slot| {
            let keep = key.model != model;
            if !keep && slot.initialized() {
                dropped += 1;
            }
            keep
        });
        dropped
    }

    async fn ensure_installed(&self, model: &str) -> Result<(), InferenceError> {
        if !self.app_config.autoload_galleries {
            return Ok(());
        }
        let Some(installer) = &self.installer else {
            return Ok(());
        };
        let path = self.app_config.model_path.join(model);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        log::info!("Model {} not found in {:?}, installing", model, self.app_config.model_path);
        installer
            .install(model, &self.app_config.model_path)
            .await
            .map_err(|e| InferenceError::install(model, e))
    }

    async fn load(&self, config: &BackendConfig) -> Result<BackendHandle, InferenceError> {
        self.ensure_installed(&config.model).await?;
        match &config.backend {
            Some(backend) => self
                .launcher
                .launch(backend, &config.model, config)
                .await
                .map_err(|e| InferenceError::resolution(&config.model, e)),
            None => self.load_greedy(config).await,
        }
    }

    async fn load_greedy(&self, config: &BackendConfig) -> Result<BackendHandle, InferenceError> {
        let mut failures = Vec::new();
        for backend in &self.app_config.backends {
            match self.launcher.launch(backend, &config.model, config).await {
                Ok(handle) => {
                    log::debug!("Loaded {} with backend {}", config.model, backend);
                    return Ok(handle);
                }
                Err(e) => {
                    log::debug!("Backend {} could not load {}: {}", backend, config.model, e);
                    failures.push(format!("{}: {}", backend, e));
                }
            }
        }
        if failures.is_empty() {
            return Err(InferenceError::resolution(&config.model, "no backends configured"));
        }
        Err(InferenceError::resolution(&config.model, failures.join("; ")))
    }
}

#[async_trait]
impl ModelResolver for ModelLoader {
    async fn resolve(&self, config: &BackendConfig) -> Result<BackendHandle, InferenceError> {
        let key = ModelKey::new(config);
        // The map guard must not be held across the load below.
        let slot = self.loaded.entry(key.clone()).or_default().clone();
        if let Some(handle) = slot.get() {
            log::debug!("Reusing loaded backend {}", key.to_string());
            return Ok(handle.clone());
        }

        // A failed load leaves the slot empty; the next caller retries.
        let handle = slot.get_or_try_init(|| self.load(config)).await?;
        Ok(handle.clone())
    }
}
