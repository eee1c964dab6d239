//! Image presence/pull seam, split from the runtime trait so pull policy
//! logic can be tested without a daemon.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{ContainerRuntime, RuntimeError};

#[async_trait]
pub trait ImagePuller: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    async fn is_image_present(&self, image: &str) -> Result<bool, RuntimeError>;
}

/// Pulls through the runtime daemon.
pub struct RuntimePuller {
    runtime: Arc<dyn ContainerRuntime>,
}

impl RuntimePuller {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        RuntimePuller { runtime }
    }
}

#[async_trait]
impl ImagePuller for RuntimePuller {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.runtime.pull_image(image).await
    }

    async fn is_image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.runtime.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NoSuchImage { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}
