//! The capability facade for one machine.
//!
//! A [`Target`] combines the connection manager of one machine with the shared
//! capability registry. It caches the family chain after the first
//! detection, and honours an explicit family override by skipping detection
//! altogether.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8Path;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::capability::{
    CapabilityArgs, CapabilityError, CapabilityOutput, Communicate, Guest,
};
use crate::connection::{CommunicatorError, ConnectionManager};
use crate::exec::{Command, CommandOutput};
use crate::family::{self, FamilyChain};
use crate::registry::{CapabilityRegistry, FamilyId};
use crate::transport::{EngineFuture, Transport};

/// A machine the engine can run commands and capabilities against.
pub struct Target<T: Transport> {
    name: String,
    manager: ConnectionManager<T>,
    registry: Arc<CapabilityRegistry>,
    pinned: Option<FamilyId>,
    chain: Mutex<Option<FamilyChain>>,
}

impl<T: Transport> Target<T> {
    /// Creates a target whose family is detected on first use.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager<T>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            manager,
            registry,
            pinned: None,
            chain: Mutex::new(None),
        }
    }

    /// Pins the target to `family`, bypassing detection.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::UnknownFamily`] when the registry does not
    /// know `family`.
    pub fn with_family(mut self, family: &str) -> Result<Self, CapabilityError> {
        let chain = family::pinned_chain(&self.registry, family)?;
        self.pinned = Some(FamilyId::new(family));
        self.chain = Mutex::new(Some(chain));
        Ok(self)
    }

    /// Human-readable name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection manager of this target.
    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    /// Registry used for dispatch.
    #[must_use]
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Returns the family chain, detecting it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::Communicator`] when detection cannot reach
    /// the target. Failed detections are not cached.
    pub async fn family_chain(&self) -> Result<FamilyChain, CapabilityError> {
        let mut cached = self.chain.lock().await;
        if let Some(chain) = cached.as_ref() {
            return Ok(chain.clone());
        }
        info!(machine = %self.name, "detecting family");
        let chain = family::detect_chain(&self.registry, self).await?;
        Ok(cached.insert(chain).clone())
    }

    /// Forgets the detected chain, e.g. after the machine was reprovisioned.
    /// A pinned family survives.
    pub async fn invalidate_family(&self) {
        let mut cached = self.chain.lock().await;
        *cached = match &self.pinned {
            Some(family) => Some(FamilyChain::new(vec![family.clone()])),
            None => None,
        };
    }

    /// Closes the session; the next command reconnects.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicatorError::Transport`] when disconnecting fails.
    pub async fn close(&self) -> Result<(), CommunicatorError> {
        self.manager.close().await
    }
}

impl<T: Transport> Communicate for Target<T> {
    fn run(&self, command: Command) -> EngineFuture<'_, CommandOutput, CommunicatorError> {
        Box::pin(self.manager.run(command))
    }

    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> EngineFuture<'a, (), CommunicatorError> {
        Box::pin(self.manager.upload(local, remote))
    }

    fn download<'a>(
        &'a self,
        remote: &'a str,
        local: &'a Utf8Path,
    ) -> EngineFuture<'a, (), CommunicatorError> {
        Box::pin(self.manager.download(remote, local))
    }
}

impl<T: Transport> Guest for Target<T> {
    fn capability<'a>(
        &'a self,
        name: &'a str,
        args: CapabilityArgs,
    ) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
        Box::pin(async move {
            let chain = self.family_chain().await?;
            let (family, provider) = family::resolve_capability(&self.registry, &chain, name)?;
            info!(machine = %self.name, capability = name, family = %family, "invoking capability");
            provider.invoke(self, &args).await
        })
    }

    fn has_capability<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            match self.family_chain().await {
                Ok(chain) => family::resolve_capability(&self.registry, &chain, name).is_ok(),
                Err(err) => {
                    warn!(machine = %self.name, capability = name, error = %err, "capability check failed");
                    false
                }
            }
        })
    }
}
