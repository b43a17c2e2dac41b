//! Built-in OS families and their capability providers.
//!
//! [`builtin_registry`] registers the detection rules and providers shipped
//! with the engine. Providers are plain functions wrapped with
//! [`provider`](crate::capability::provider); typed arguments are parsed from
//! the positional JSON values with `serde`.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use shell_escape::unix::escape;
use tracing::debug;

use crate::capability::{CapabilityArgs, CapabilityError, CapabilityOutput, Guest, provider};
use crate::connection::CommunicatorError;
use crate::registry::{CapabilityRegistry, CommandProbe, RegistryBuilder, RegistryError};

mod alpine;
mod bsd;
mod debian;
mod linux;
mod redhat;

/// Family closing every chain.
pub const GENERIC: &str = "generic";

/// Builds the registry of built-in families.
///
/// # Errors
///
/// Returns [`RegistryError`] if two built-ins claim the same slot.
pub fn builtin_registry() -> Result<CapabilityRegistry, RegistryError> {
    let mut builder = RegistryBuilder::new(GENERIC);
    register_builtins(&mut builder)?;
    builder.build()
}

/// Adds the built-in rules and providers to `builder`, so callers can layer
/// their own registrations on top before building.
///
/// # Errors
///
/// Returns [`RegistryError`] when a slot is already taken.
pub fn register_builtins(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder
        .register_family("linux", 10, probe("uname -s | grep -q Linux"))?
        .register_family("freebsd", 10, probe("uname -s | grep -q FreeBSD"))?
        .register_family("darwin", 10, probe("uname -s | grep -q Darwin"))?
        .register_family("debian", 20, probe("test -f /etc/debian_version"))?
        .register_family("redhat", 20, probe("test -f /etc/redhat-release"))?
        .register_family("alpine", 20, probe("test -f /etc/alpine-release"))?
        .register_family("ubuntu", 30, probe("grep -q '^ID=ubuntu' /etc/os-release"))?;

    builder
        .register("linux", "halt", provider(linux::halt))?
        .register("linux", "change_host_name", provider(linux::change_host_name))?
        .register("linux", "insert_public_key", provider(linux::insert_public_key))?
        .register("linux", "remove_public_key", provider(linux::remove_public_key))?
        .register("linux", "network_interfaces", provider(linux::network_interfaces))?
        .register("linux", "mount_nfs_folder", provider(linux::mount_nfs_folder))?
        .register("debian", "change_host_name", provider(debian::change_host_name))?
        .register("debian", "configure_networks", provider(debian::configure_networks))?
        .register("debian", "install_package", provider(debian::install_package))?
        .register("redhat", "configure_networks", provider(redhat::configure_networks))?
        .register("redhat", "install_package", provider(redhat::install_package))?
        .register("alpine", "halt", provider(alpine::halt))?
        .register("alpine", "install_package", provider(alpine::install_package))?
        .register("freebsd", "halt", provider(bsd::freebsd_halt))?
        .register("freebsd", "change_host_name", provider(bsd::freebsd_change_host_name))?
        .register("freebsd", "install_package", provider(bsd::freebsd_install_package))?
        .register("darwin", "halt", provider(bsd::darwin_halt))?
        .register("darwin", "change_host_name", provider(bsd::darwin_change_host_name))?;
    Ok(())
}

fn probe(command: &str) -> Arc<CommandProbe> {
    Arc::new(CommandProbe::new(command))
}

/// Shell-quotes `value` for interpolation into a remote command.
fn quote(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

/// Runs a power-off command. The session usually drops before an exit
/// status arrives, which counts as success.
async fn power_off(guest: &dyn Guest, command: &str) -> Result<CapabilityOutput, CapabilityError> {
    match guest.sudo(command).await {
        Ok(_) => Ok(Value::Null),
        Err(
            err @ (CommunicatorError::MissingExitStatus { .. }
            | CommunicatorError::Transport { .. }),
        ) => {
            debug!(error = %err, "connection dropped while halting");
            Ok(Value::Null)
        }
        Err(err) => Err(err.into()),
    }
}

/// One package name or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Packages {
    One(String),
    Many(Vec<String>),
}

/// Reads the package argument and renders it as quoted shell words.
fn package_words(args: &CapabilityArgs) -> Result<String, CapabilityError> {
    let names = match args.parse::<Packages>(0)? {
        Packages::One(name) => vec![name],
        Packages::Many(names) => names,
    };
    if names.is_empty() || names.iter().any(String::is_empty) {
        return Err(CapabilityError::InvalidArgument {
            index: 0,
            message: String::from("package names must not be empty"),
        });
    }
    Ok(names
        .iter()
        .map(|name| quote(name).into_owned())
        .collect::<Vec<_>>()
        .join(" "))
}

/// Addressing mode of a configured interface.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
enum AddressMode {
    Dhcp,
    Static,
}

/// One entry of the `configure_networks` argument.
#[derive(Clone, Debug, Deserialize)]
struct Network {
    /// Index into the list returned by `network_interfaces`.
    interface: usize,
    #[serde(rename = "type")]
    mode: AddressMode,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    netmask: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

impl Network {
    fn static_address(&self) -> Result<(&str, &str), CapabilityError> {
        match (self.ip.as_deref(), self.netmask.as_deref()) {
            (Some(ip), Some(netmask)) => Ok((ip, netmask)),
            _ => Err(CapabilityError::InvalidArgument {
                index: 0,
                message: format!("static interface {} needs ip and netmask", self.interface),
            }),
        }
    }
}

/// Parses the network list and pairs every entry with its device name,
/// looked up through the guest's own `network_interfaces` capability.
async fn networks_with_devices(
    guest: &dyn Guest,
    args: &CapabilityArgs,
) -> Result<Vec<(String, Network)>, CapabilityError> {
    let networks: Vec<Network> = args.parse(0)?;
    let devices: Vec<String> = serde_json::from_value(
        guest
            .capability("network_interfaces", CapabilityArgs::empty())
            .await?,
    )
    .map_err(|err| CapabilityError::Provider {
        message: format!("network_interfaces returned an unexpected value: {err}"),
    })?;
    networks
        .into_iter()
        .map(|network| {
            let device = devices.get(network.interface).cloned().ok_or_else(|| {
                CapabilityError::Provider {
                    message: format!(
                        "interface {} does not exist ({} found)",
                        network.interface,
                        devices.len()
                    ),
                }
            })?;
            Ok((device, network))
        })
        .collect()
}

/// Reads a non-empty host name argument.
fn host_name(args: &CapabilityArgs) -> Result<&str, CapabilityError> {
    let name = args.str(0)?;
    if name.is_empty() {
        return Err(CapabilityError::InvalidArgument {
            index: 0,
            message: String::from("host name must not be empty"),
        });
    }
    Ok(name)
}

/// First label of a fully qualified host name.
fn short_name(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests;
