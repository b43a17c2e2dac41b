//! Alpine Linux.

use serde_json::Value;

use super::{package_words, power_off};
use crate::capability::{CapabilityArgs, CapabilityError, CapabilityOutput, Guest};
use crate::transport::EngineFuture;

/// BusyBox has no `shutdown`.
pub(super) fn halt<'a>(
    guest: &'a dyn Guest,
    _args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(power_off(guest, "poweroff"))
}

pub(super) fn install_package<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let packages = package_words(args)?;
        guest.sudo(&format!("apk add --no-cache {packages}")).await?;
        Ok(Value::Null)
    })
}
