use crate::openai::pipelines::llm_engine::{EngineError, LLMEngine};
use crate::openai::responses::EngineStatus;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Lifecycle of the process-wide engine.
#[derive(Default)]
pub enum EngineState {
    /// Not loaded yet, or released at shutdown.
    #[default]
    Uninitialized,
    /// Loaded and serving.
    Ready(Arc<LLMEngine>),
    /// Loading failed; the message is kept for diagnostics.
    Failed(String),
}

/// Shared handle to the engine, injected into every request handler.
#[derive(Clone, Default)]
pub struct EngineHolder {
    state: Arc<RwLock<EngineState>>,
}

impl EngineHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the engine once. A failure leaves the holder in `Failed` and is
    /// returned to the caller, which must not start serving.
    pub fn initialize<F>(&self, load: F) -> anyhow::Result<Arc<LLMEngine>>
    where
        F: FnOnce() -> anyhow::Result<LLMEngine>,
    {
        if let EngineState::Ready(engine) = &*self.state.read() {
            warn!("Inference engine is already initialized");
            return Ok(engine.clone());
        }
        match load() {
            Ok(engine) => {
                let engine = Arc::new(engine);
                *self.state.write() = EngineState::Ready(engine.clone());
                info!("Inference engine is ready");
                Ok(engine)
            }
            Err(e) => {
                error!("Failed to initialize the inference engine: {e:#}");
                *self.state.write() = EngineState::Failed(format!("{e:#}"));
                Err(e)
            }
        }
    }

    /// The ready engine, or `EngineUnavailable` in any other state.
    pub fn engine(&self) -> Result<Arc<LLMEngine>, EngineError> {
        match &*self.state.read() {
            EngineState::Ready(engine) => Ok(engine.clone()),
            _ => Err(EngineError::EngineUnavailable),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(&*self.state.read(), EngineState::Ready(_))
    }

    pub fn status(&self) -> EngineStatus {
        if self.is_available() {
            EngineStatus::Available
        } else {
            EngineStatus::Unavailable
        }
    }

    pub fn failure(&self) -> Option<String> {
        match &*self.state.read() {
            EngineState::Failed(msg) => Some(msg.clone()),
            _ => None,
        }
    }

    /// Drop the holder's reference. Generations still running keep their own
    /// reference until they finish.
    pub fn shutdown(&self) {
        let previous = std::mem::take(&mut *self.state.write());
        if let EngineState::Ready(engine) = previous {
            info!(
                in_flight = Arc::strong_count(&engine) - 1,
                "Releasing the inference engine"
            );
        }
    }
}
