//! Process-wide default instance
//!
//! The configuration and the live default instance sit behind one lock, so
//! concurrent first calls to [`default_instance`] open a single instance.

use crate::engine::Collaborators;
use crate::error::FetchError;
use crate::DownloadEngine;
use fetchq_types::EngineConfig;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Default)]
struct DefaultSlot {
    config: Option<(EngineConfig, Collaborators)>,
    instance: Option<DownloadEngine>,
}

fn slot() -> &'static Mutex<DefaultSlot> {
    static DEFAULT: OnceLock<Mutex<DefaultSlot>> = OnceLock::new();
    DEFAULT.get_or_init(|| Mutex::new(DefaultSlot::default()))
}

pub(crate) async fn set_default_config(config: EngineConfig, collaborators: Collaborators) {
    let mut slot = slot().lock().await;
    info!("Default engine configuration set for namespace {}", config.namespace);
    slot.config = Some((config, collaborators));
}

pub(crate) async fn default_instance() -> Result<DownloadEngine, FetchError> {
    let mut slot = slot().lock().await;
    if let Some(instance) = slot.instance.as_ref().filter(|i| !i.is_closed()) {
        return Ok(instance.clone());
    }

    let (config, collaborators) = slot.config.clone().ok_or(FetchError::NotConfigured)?;
    let instance = DownloadEngine::open(config, collaborators).await?;
    slot.instance = Some(instance.clone());
    Ok(instance)
}
