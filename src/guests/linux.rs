//! Providers shared by every Linux distribution.

use serde::Deserialize;
use serde_json::{Value, json};

use super::{host_name, power_off, quote, short_name};
use crate::capability::{CapabilityArgs, CapabilityError, CapabilityOutput, Guest};
use crate::exec::Command;
use crate::transport::EngineFuture;

pub(super) fn halt<'a>(
    guest: &'a dyn Guest,
    _args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(power_off(guest, "shutdown -h now"))
}

/// Sets the transient and persistent host name. Returns whether anything
/// changed.
pub(super) fn change_host_name<'a>(
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
                "echo {quoted} > /etc/hostname\nhostname {short}"
            ))
            .await?;
        Ok(json!(true))
    })
}

/// Appends a public key to the login user's `authorized_keys` unless present.
pub(super) fn insert_public_key<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let key = public_key(args)?;
        let quoted = quote(key);
        guest
            .execute(&format!(
                "mkdir -p ~/.ssh\n\
                 chmod 0700 ~/.ssh\n\
                 touch ~/.ssh/authorized_keys\n\
                 chmod 0600 ~/.ssh/authorized_keys\n\
                 grep -qxF {quoted} ~/.ssh/authorized_keys || echo {quoted} >> ~/.ssh/authorized_keys"
            ))
            .await?;
        Ok(Value::Null)
    })
}

/// Removes every line equal to the key from `authorized_keys`.
pub(super) fn remove_public_key<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let key = public_key(args)?;
        let quoted = quote(key);
        guest
            .execute(&format!(
                "if test -f ~/.ssh/authorized_keys; then\n\
                 grep -vxF {quoted} ~/.ssh/authorized_keys > ~/.ssh/authorized_keys.tether || true\n\
                 mv ~/.ssh/authorized_keys.tether ~/.ssh/authorized_keys\n\
                 chmod 0600 ~/.ssh/authorized_keys\n\
                 fi"
            ))
            .await?;
        Ok(Value::Null)
    })
}

fn public_key(args: &CapabilityArgs) -> Result<&str, CapabilityError> {
    let key = args.str(0)?.trim();
    if key.is_empty() || key.contains('\n') {
        return Err(CapabilityError::InvalidArgument {
            index: 0,
            message: String::from("expected a single public key line"),
        });
    }
    Ok(key)
}

/// Lists network devices except loopback, in the order interface indexes
/// refer to them.
pub(super) fn network_interfaces<'a>(
    guest: &'a dyn Guest,
    _args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let output = guest.run(Command::new("ls -1 /sys/class/net")).await?;
        let mut devices: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|device| !device.is_empty() && *device != "lo")
            .collect();
        devices.sort_by(|left, right| device_order(left).cmp(&device_order(right)));
        Ok(json!(devices))
    })
}

/// Sort key placing `eth*`/`en*` devices first, then by name with numeric
/// suffixes compared as numbers.
fn device_order(device: &str) -> (bool, String, u64) {
    let wired = device.starts_with("eth") || device.starts_with("en");
    let split = device
        .char_indices()
        .rev()
        .take_while(|(_, ch)| ch.is_ascii_digit())
        .last()
        .map_or(device.len(), |(index, _)| index);
    let (stem, digits) = device.split_at(split);
    (!wired, stem.to_owned(), digits.parse().unwrap_or(0))
}

fn default_nfs_version() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
struct NfsFolder {
    hostpath: String,
    guestpath: String,
    #[serde(default = "default_nfs_version")]
    nfs_version: u32,
    #[serde(default)]
    udp: bool,
    #[serde(default)]
    mount_options: Vec<String>,
}

/// Mounts NFS exports of `ip` (argument 0) described by argument 1.
pub(super) fn mount_nfs_folder<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let ip = args.str(0)?;
        let folders: Vec<NfsFolder> = args.parse(1)?;
        for folder in &folders {
            let mut options = vec![format!("vers={}", folder.nfs_version)];
            if folder.udp {
                options.push(String::from("udp"));
            }
            options.extend(folder.mount_options.iter().cloned());
            let guestpath = quote(&folder.guestpath);
            let source = quote(&format!("{ip}:{}", folder.hostpath)).into_owned();
            let joined = quote(&options.join(",")).into_owned();
            guest
                .sudo(&format!(
                    "mkdir -p {guestpath}\nmount -o {joined} {source} {guestpath}"
                ))
                .await?;
        }
        Ok(json!(folders.len()))
    })
}
