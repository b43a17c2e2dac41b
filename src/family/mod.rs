//! Family chain resolution.
//!
//! Every detection rule runs against the target; matching families are
//! ordered by descending precedence, ties broken by registration order (the
//! sort is stable and rules are stored in registration order). The
//! registry's fallback family always closes the chain, so a target nobody
//! recognises still resolves to something.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::capability::{Capability, CapabilityError, Communicate};
use crate::connection::CommunicatorError;
use crate::registry::{CapabilityRegistry, FamilyId};

/// Ordered family identifiers, most specific first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FamilyChain(Vec<FamilyId>);

impl FamilyChain {
    /// Wraps an explicit list of families.
    #[must_use]
    pub const fn new(families: Vec<FamilyId>) -> Self {
        Self(families)
    }

    /// Families in resolution order.
    #[must_use]
    pub fn families(&self) -> &[FamilyId] {
        &self.0
    }

    /// Most specific family.
    #[must_use]
    pub fn head(&self) -> Option<&FamilyId> {
        self.0.first()
    }

    /// Whether `family` is part of the chain.
    #[must_use]
    pub fn contains(&self, family: &str) -> bool {
        self.0.iter().any(|id| id.as_str() == family)
    }

    /// Number of families in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FamilyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, family) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{family}")?;
        }
        f.write_str("]")
    }
}

/// Detects the chain for `target` by running every registered rule.
///
/// # Errors
///
/// Returns the first [`CommunicatorError`] raised by a detector; the probes
/// are read-only, so a failure means the target is unreachable rather than a
/// negative match.
pub async fn detect_chain(
    registry: &CapabilityRegistry,
    target: &dyn Communicate,
) -> Result<FamilyChain, CommunicatorError> {
    let mut matches = Vec::new();
    for rule in registry.rules() {
        let matched = rule.detector().detect(target).await?;
        debug!(family = %rule.family(), precedence = rule.precedence(), matched, "detection rule evaluated");
        if matched && rule.family() != registry.fallback() {
            matches.push((rule.precedence(), rule.family().clone()));
        }
    }
    matches.sort_by(|left, right| right.0.cmp(&left.0));

    let mut families: Vec<FamilyId> = matches.into_iter().map(|(_, family)| family).collect();
    families.push(registry.fallback().clone());
    let chain = FamilyChain(families);
    info!(chain = %chain, "family chain detected");
    Ok(chain)
}

/// Builds the one-element chain for an explicitly configured family.
///
/// # Errors
///
/// Returns [`CapabilityError::UnknownFamily`] when the registry has never
/// heard of `family`.
pub fn pinned_chain(
    registry: &CapabilityRegistry,
    family: &str,
) -> Result<FamilyChain, CapabilityError> {
    if !registry.is_known(family) {
        return Err(CapabilityError::UnknownFamily {
            family: family.to_owned(),
        });
    }
    Ok(FamilyChain(vec![FamilyId::new(family)]))
}

/// Walks `chain` and returns the first family providing `capability`.
///
/// # Errors
///
/// Returns [`CapabilityError::CapabilityNotFound`] carrying the capability
/// and the whole chain when no family provides it.
pub fn resolve_capability(
    registry: &CapabilityRegistry,
    chain: &FamilyChain,
    capability: &str,
) -> Result<(FamilyId, Arc<dyn Capability>), CapabilityError> {
    for family in chain.families() {
        debug!(family = %family, capability, "searching for capability");
        if let Some(provider) = registry.lookup(family.as_str(), capability) {
            debug!(family = %family, capability, "capability found");
            return Ok((family.clone(), provider));
        }
    }
    Err(CapabilityError::CapabilityNotFound {
        capability: capability.to_owned(),
        chain: chain.clone(),
    })
}
