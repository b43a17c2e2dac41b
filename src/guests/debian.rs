//! Debian and derivatives.

use std::fmt::Write as _;

use serde_json::{Value, json};

use super::{
    AddressMode, Network, host_name, networks_with_devices, package_words, quote, short_name,
};
use crate::capability::{CapabilityArgs, CapabilityError, CapabilityOutput, Guest};
use crate::transport::EngineFuture;

const BLOCK_BEGIN: &str = "#TETHER-BEGIN";
const BLOCK_END: &str = "#TETHER-END";
const STAGING_PATH: &str = "/tmp/tether-network-entry";

/// Sets the host name, the `127.0.1.1` entry of `/etc/hosts`, and the mail
/// name when one is configured.
pub(super) fn change_host_name<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let name = host_name(args)?;
        let quoted = quote(name);
        if guest.test(&format!("hostname -f | grep -qx {quoted}")).await? {
            return Ok(json!(false));
        }
        let short = quote(short_name(name));
        guest
            .sudo(&format!(
                "echo {short} > /etc/hostname\n\
                 hostname {short}\n\
                 sed -i '/^127\\.0\\.1\\.1\\s/d' /etc/hosts\n\
                 printf '127.0.1.1\\t%s %s\\n' {quoted} {short} >> /etc/hosts\n\
                 if test -f /etc/mailname; then echo {quoted} > /etc/mailname; fi"
            ))
            .await?;
        Ok(json!(true))
    })
}

/// Renders the managed block appended to `/etc/network/interfaces`.
fn interfaces_block(networks: &[(String, Network)]) -> Result<String, CapabilityError> {
    let mut block = format!(
        "{BLOCK_BEGIN}\n# Managed by tether; changes inside this block are overwritten.\n"
    );
    for (device, network) in networks {
        match network.mode {
            AddressMode::Dhcp => {
                writeln!(block, "auto {device}\niface {device} inet dhcp").ok();
            }
            AddressMode::Static => {
                let (ip, netmask) = network.static_address()?;
                writeln!(
                    block,
                    "auto {device}\niface {device} inet static\n      address {ip}\n      netmask {netmask}"
                ).ok();
                if let Some(gateway) = &network.gateway {
                    writeln!(block, "      gateway {gateway}").ok();
                }
            }
        }
    }
    block.push_str(BLOCK_END);
    block.push('\n');
    Ok(block)
}

/// Replaces the managed block of `/etc/network/interfaces` and restarts the
/// affected devices.
pub(super) fn configure_networks<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let networks = networks_with_devices(guest, args).await?;
        if networks.is_empty() {
            return Ok(json!([]));
        }
        let block = interfaces_block(&networks)?;
        let devices: Vec<String> = networks
            .iter()
            .map(|(device, _)| quote(device).into_owned())
            .collect();

        let mut script = format!("cat > {STAGING_PATH} <<'TETHER_NETWORK'\n{block}TETHER_NETWORK\n");
        writeln!(
            script,
            "sed -i -e '/^{BLOCK_BEGIN}/,/^{BLOCK_END}/ d' /etc/network/interfaces"
        ).ok();
        for device in &devices {
            writeln!(script, "/sbin/ifdown {device} 2> /dev/null || true").ok();
        }
        writeln!(script, "cat {STAGING_PATH} >> /etc/network/interfaces").ok();
        writeln!(script, "rm -f {STAGING_PATH}").ok();
        for device in &devices {
            writeln!(script, "/sbin/ifup {device}").ok();
        }
        guest.sudo(script.trim_end()).await?;

        let configured: Vec<Value> = networks
            .into_iter()
            .map(|(device, _)| Value::String(device))
            .collect();
        Ok(Value::Array(configured))
    })
}

pub(super) fn install_package<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let packages = package_words(args)?;
        guest
            .sudo(&format!(
                "apt-get -qq update && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {packages}"
            ))
            .await?;
        Ok(Value::Null)
    })
}
