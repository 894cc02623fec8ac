use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use super::bluejeans::BluejeansBackend;
use super::inperson::InPersonBackend;
use super::zoom::ZoomBackend;
use super::{BackendPublicData, MeetingBackend};
use crate::config::AppConfig;
use crate::shared::error::ApiError;
use crate::shared::utils::DbPool;

/// Fixed name → provider table, built once at process start from the set of
/// providers whose configuration is present. Stale names left behind in the
/// database (a provider was disabled after rows referenced it) resolve to
/// `ApiError::DisabledBackend`, never a lookup panic.
pub struct BackendRegistry {
    instances: HashMap<&'static str, Arc<dyn MeetingBackend>>,
    default_backend: String,
    zoom: Option<Arc<ZoomBackend>>,
}

impl BackendRegistry {
    pub fn from_config(config: &AppConfig, pool: &DbPool) -> Result<Self> {
        let mut instances: HashMap<&'static str, Arc<dyn MeetingBackend>> = HashMap::new();
        instances.insert(super::inperson::NAME, Arc::new(InPersonBackend));

        let mut zoom = None;
        if let Some(zoom_config) = &config.zoom {
            let backend = Arc::new(ZoomBackend::new(zoom_config.clone(), pool.clone()));
            instances.insert(super::zoom::NAME, backend.clone());
            zoom = Some(backend);
        }
        if let Some(bluejeans_config) = &config.bluejeans {
            instances.insert(
                super::bluejeans::NAME,
                Arc::new(BluejeansBackend::new(bluejeans_config.clone())),
            );
        }

        if !instances.contains_key(config.default_backend.as_str()) {
            bail!(
                "default backend {:?} is not enabled; enabled backends: {:?}",
                config.default_backend,
                instances.keys().collect::<Vec<_>>(),
            );
        }

        Ok(Self {
            instances,
            default_backend: config.default_backend.clone(),
            zoom,
        })
    }

    /// Registry over explicit instances; the default must be one of them.
    pub fn from_instances(
        instances: Vec<Arc<dyn MeetingBackend>>,
        default_backend: &str,
    ) -> Result<Self> {
        let instances: HashMap<&'static str, Arc<dyn MeetingBackend>> =
            instances.into_iter().map(|b| (b.name(), b)).collect();
        if !instances.contains_key(default_backend) {
            bail!("default backend {default_backend:?} is not among the provided instances");
        }
        Ok(Self {
            instances,
            default_backend: default_backend.to_string(),
            zoom: None,
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn MeetingBackend>, ApiError> {
        self.instances
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::DisabledBackend(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn default_backend(&self) -> &str {
        &self.default_backend
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.instances.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn public_data(&self) -> Vec<BackendPublicData> {
        let mut data: Vec<BackendPublicData> =
            self.instances.values().map(|b| b.public_data()).collect();
        data.sort_by_key(|d| d.name);
        data
    }

    pub fn zoom(&self) -> Option<Arc<ZoomBackend>> {
        self.zoom.clone()
    }
}
