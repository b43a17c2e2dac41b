//! FreeBSD and macOS.

use serde_json::{Value, json};

use super::{host_name, package_words, power_off, quote, short_name};
use crate::capability::{CapabilityArgs, CapabilityError, CapabilityOutput, Guest};
use crate::transport::EngineFuture;

pub(super) fn freebsd_halt<'a>(
    guest: &'a dyn Guest,
    _args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(power_off(guest, "shutdown -p now"))
}

/// Persists the name in `rc.conf` through `sysrc`.
pub(super) fn freebsd_change_host_name<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let name = host_name(args)?;
        let quoted = quote(name);
        if guest.test(&format!("hostname | grep -qx {quoted}")).await? {
            return Ok(json!(false));
        }
        let setting = quote(&format!("hostname={name}")).into_owned();
        guest
            .sudo(&format!("sysrc {setting}\nhostname {quoted}"))
            .await?;
        Ok(json!(true))
    })
}

pub(super) fn freebsd_install_package<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let packages = package_words(args)?;
        guest
            .sudo(&format!("env ASSUME_ALWAYS_YES=yes pkg install {packages}"))
            .await?;
        Ok(Value::Null)
    })
}

pub(super) fn darwin_halt<'a>(
    guest: &'a dyn Guest,
    _args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(power_off(guest, "shutdown -h now"))
}

/// Sets the computer, host and Bonjour names through `scutil`.
pub(super) fn darwin_change_host_name<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let name = host_name(args)?;
        let quoted = quote(name);
        if guest.test(&format!("hostname | grep -qx {quoted}")).await? {
            return Ok(json!(false));
        }
        let short = quote(short_name(name));
        guest
            .sudo(&format!(
                "scutil --set ComputerName {quoted}\n\
                 scutil --set HostName {quoted}\n\
                 scutil --set LocalHostName {short}\n\
                 hostname {quoted}"
            ))
            .await?;
        Ok(json!(true))
    })
}
