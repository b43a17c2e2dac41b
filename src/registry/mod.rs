//! Capability registry: the process-wide table of detection rules and
//! `(family, capability) -> provider` registrations.
//!
//! Registration happens on a [`RegistryBuilder`] at startup. `build` freezes
//! the table into an immutable [`CapabilityRegistry`] which is shared through
//! an `Arc` by every target, so no registration can happen after dispatch has
//! begun.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::capability::{Capability, Communicate};
use crate::connection::CommunicatorError;
use crate::transport::EngineFuture;

/// Identifier of an OS family, e.g. `debian` or `linux`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FamilyId(String);

impl FamilyId {
    /// Creates an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for FamilyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FamilyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Decides whether a target belongs to a family by probing it.
pub trait Detect: Send + Sync {
    /// Runs read-only probes against `target`.
    fn detect<'a>(&'a self, target: &'a dyn Communicate)
    -> EngineFuture<'a, bool, CommunicatorError>;
}

/// Detector that matches when a shell command exits zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandProbe {
    command: String,
}

impl CommandProbe {
    /// Creates a probe running `command` through `test`.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Detect for CommandProbe {
    fn detect<'a>(
        &'a self,
        target: &'a dyn Communicate,
    ) -> EngineFuture<'a, bool, CommunicatorError> {
        target.test(&self.command)
    }
}

/// Errors raised while building the registry.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// The same `(family, capability)` pair was registered twice.
    #[error("capability '{capability}' registered twice for family '{family}'")]
    DuplicateRegistration {
        /// Family of the conflicting registrations.
        family: FamilyId,
        /// Capability of the conflicting registrations.
        capability: String,
    },
    /// A family received two detection rules.
    #[error("family '{family}' has more than one detection rule")]
    DuplicateFamily {
        /// Family registered twice.
        family: FamilyId,
    },
}

/// A detection rule with its precedence.
#[derive(Clone)]
pub struct DetectionRule {
    family: FamilyId,
    precedence: i32,
    detector: Arc<dyn Detect>,
}

impl DetectionRule {
    /// Family this rule detects.
    #[must_use]
    pub const fn family(&self) -> &FamilyId {
        &self.family
    }

    /// Precedence used to order competing matches.
    #[must_use]
    pub const fn precedence(&self) -> i32 {
        self.precedence
    }

    /// Detector implementing the rule.
    #[must_use]
    pub fn detector(&self) -> &dyn Detect {
        self.detector.as_ref()
    }
}

impl fmt::Debug for DetectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectionRule")
            .field("family", &self.family)
            .field("precedence", &self.precedence)
            .finish_non_exhaustive()
    }
}

type ProviderTable = HashMap<FamilyId, HashMap<String, Arc<dyn Capability>>>;

/// Collects registrations before the registry is frozen.
pub struct RegistryBuilder {
    fallback: FamilyId,
    rules: Vec<DetectionRule>,
    providers: ProviderTable,
    conflicts: Vec<RegistryError>,
}

impl RegistryBuilder {
    /// Starts a registry whose chains end in `fallback`.
    #[must_use]
    pub fn new(fallback: impl Into<FamilyId>) -> Self {
        Self {
            fallback: fallback.into(),
            rules: Vec::new(),
            providers: HashMap::new(),
            conflicts: Vec::new(),
        }
    }

    /// Registers the detection rule for `family`. Rules are remembered in
    /// registration order, which breaks precedence ties.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateFamily`] when `family` already has a
    /// rule; the builder then refuses to build.
    pub fn register_family(
        &mut self,
        family: impl Into<FamilyId>,
        precedence: i32,
        detector: Arc<dyn Detect>,
    ) -> Result<&mut Self, RegistryError> {
        let family = family.into();
        if self.rules.iter().any(|rule| rule.family == family) {
            let err = RegistryError::DuplicateFamily { family };
            self.conflicts.push(err.clone());
            return Err(err);
        }
        self.rules.push(DetectionRule {
            family,
            precedence,
            detector,
        });
        Ok(self)
    }

    /// Registers `provider` for `(family, capability)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateRegistration`] when the pair is
    /// already taken. Neither registration survives and the builder refuses
    /// to build.
    pub fn register(
        &mut self,
        family: impl Into<FamilyId>,
        capability: impl Into<String>,
        provider: Arc<dyn Capability>,
    ) -> Result<&mut Self, RegistryError> {
        let family = family.into();
        let capability = capability.into();
        let table = self.providers.entry(family.clone()).or_default();
        if table.remove(&capability).is_some() {
            let err = RegistryError::DuplicateRegistration { family, capability };
            self.conflicts.push(err.clone());
            return Err(err);
        }
        table.insert(capability, provider);
        Ok(self)
    }

    /// Freezes the registrations.
    ///
    /// # Errors
    ///
    /// Returns the first conflict recorded during registration.
    pub fn build(self) -> Result<CapabilityRegistry, RegistryError> {
        if let Some(conflict) = self.conflicts.into_iter().next() {
            return Err(conflict);
        }
        debug!(
            families = self.rules.len(),
            provider_families = self.providers.len(),
            "capability registry frozen"
        );
        Ok(CapabilityRegistry {
            fallback: self.fallback,
            rules: self.rules,
            providers: self.providers,
        })
    }
}

/// Immutable registry shared by all targets.
pub struct CapabilityRegistry {
    fallback: FamilyId,
    rules: Vec<DetectionRule>,
    providers: ProviderTable,
}

impl CapabilityRegistry {
    /// Family every chain ends with.
    #[must_use]
    pub const fn fallback(&self) -> &FamilyId {
        &self.fallback
    }

    /// Detection rules in registration order.
    #[must_use]
    pub fn rules(&self) -> &[DetectionRule] {
        &self.rules
    }

    /// Provider for `(family, capability)`, if any.
    #[must_use]
    pub fn lookup(&self, family: &str, capability: &str) -> Option<Arc<dyn Capability>> {
        self.providers
            .get(family)
            .and_then(|table| table.get(capability))
            .cloned()
    }

    /// Whether `family` has a detection rule, a provider, or is the fallback.
    #[must_use]
    pub fn is_known(&self, family: &str) -> bool {
        self.fallback.as_str() == family
            || self.rules.iter().any(|rule| rule.family.as_str() == family)
            || self.providers.contains_key(family)
    }

    /// Capability names registered for `family`, sorted.
    #[must_use]
    pub fn capabilities_of(&self, family: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .get(family)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut families: Vec<&FamilyId> = self.providers.keys().collect();
        families.sort();
        f.debug_struct("CapabilityRegistry")
            .field("fallback", &self.fallback)
            .field("rules", &self.rules)
            .field("provider_families", &families)
            .finish()
    }
}
