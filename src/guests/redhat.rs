//! Red Hat and derivatives, configured through NetworkManager.

use std::net::Ipv4Addr;

use serde_json::Value;

use super::{AddressMode, Network, networks_with_devices, package_words, quote};
use crate::capability::{CapabilityArgs, CapabilityError, CapabilityOutput, Guest};
use crate::transport::EngineFuture;

/// Converts a dotted netmask or a bare prefix length to a prefix length.
fn prefix_length(netmask: &str) -> Result<u32, CapabilityError> {
    let invalid = || CapabilityError::InvalidArgument {
        index: 0,
        message: format!("invalid netmask '{netmask}'"),
    };
    if let Ok(prefix) = netmask.parse::<u32>() {
        return if prefix <= 32 { Ok(prefix) } else { Err(invalid()) };
    }
    let mask = u32::from(netmask.parse::<Ipv4Addr>().map_err(|_| invalid())?);
    if mask.leading_ones() + mask.trailing_zeros() != 32 {
        return Err(invalid());
    }
    Ok(mask.leading_ones())
}

fn connection_command(device: &str, network: &Network) -> Result<String, CapabilityError> {
    let name = quote(&format!("tether-{device}")).into_owned();
    let ifname = quote(device);
    let addressing = match network.mode {
        AddressMode::Dhcp => String::from("ipv4.method auto"),
        AddressMode::Static => {
            let (ip, netmask) = network.static_address()?;
            let mut settings = format!(
                "ipv4.method manual ipv4.addresses {}",
                quote(&format!("{ip}/{}", prefix_length(netmask)?))
            );
            if let Some(gateway) = &network.gateway {
                settings.push_str(" ipv4.gateway ");
                settings.push_str(&quote(gateway));
            }
            settings
        }
    };
    Ok(format!(
        "nmcli connection delete {name} > /dev/null 2>&1 || true\n\
         nmcli connection add type ethernet ifname {ifname} con-name {name} {addressing}\n\
         nmcli connection up {name}"
    ))
}

/// Creates one `tether-<device>` NetworkManager connection per entry,
/// replacing any previous one.
pub(super) fn configure_networks<'a>(
    guest: &'a dyn Guest,
    args: &'a CapabilityArgs,
) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
    Box::pin(async move {
        let networks = networks_with_devices(guest, args).await?;
        let mut configured = Vec::with_capacity(networks.len());
        for (device, network) in &networks {
            guest.sudo(&connection_command(device, network)?).await?;
            configured.push(Value::String(device.clone()));
        }
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
                "if command -v dnf > /dev/null 2>&1; then dnf -y install {packages}; else yum -y install {packages}; fi"
            ))
            .await?;
        Ok(Value::Null)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("255.255.255.0", 24)]
    #[case("255.255.0.0", 16)]
    #[case("255.255.255.255", 32)]
    #[case("0.0.0.0", 0)]
    #[case("20", 20)]
    fn converts_netmasks_to_prefixes(#[case] netmask: &str, #[case] prefix: u32) {
        assert_eq!(prefix_length(netmask), Ok(prefix));
    }

    #[rstest]
    #[case("255.0.255.0")]
    #[case("33")]
    #[case("mask")]
    fn rejects_malformed_netmasks(#[case] netmask: &str) {
        assert!(prefix_length(netmask).is_err());
    }
}
