//! Unit tests for the built-in families, run against the scripted transport.

use std::time::Duration;

use super::*;
use crate::connection::{ConnectionManager, RetryPolicy};
use crate::exec::{ChannelExecutor, ShellSettings};
use crate::family::FamilyChain;
use crate::registry::FamilyId;
use crate::target::Target;
use crate::test_support::{Execution, Reply, ScriptedTransport};
use crate::transport::{ConnectionParams, TransportError};
use rstest::{fixture, rstest};
use serde_json::json;

const LINUX_PROBE: &str = "uname -s | grep -q Linux";
const DEBIAN_PROBE: &str = "test -f /etc/debian_version";
const UBUNTU_PROBE: &str = "grep -q '^ID=ubuntu' /etc/os-release";
const ALPINE_PROBE: &str = "test -f /etc/alpine-release";

/// Transport where every command fails unless a reply says otherwise.
#[fixture]
fn transport() -> ScriptedTransport {
    let transport = ScriptedTransport::new();
    transport.with_default_exit(1);
    transport
}

fn machine(transport: &ScriptedTransport) -> Target<ScriptedTransport> {
    let manager = ConnectionManager::new(
        transport.clone(),
        ConnectionParams::new("192.168.56.10", 22, "vagrant"),
        ChannelExecutor::new(ShellSettings::default()),
    )
    .with_retry_policy(RetryPolicy {
        max_tries: 1,
        retry_delay: Duration::ZERO,
        connect_timeout: Duration::from_secs(15),
        settle_delay: Duration::ZERO,
    });
    Target::new(
        "default",
        manager,
        Arc::new(builtin_registry().expect("built-ins do not conflict")),
    )
}

fn answer(transport: &ScriptedTransport, patterns: &[&str]) {
    for pattern in patterns {
        transport.respond(*pattern, Reply::exit(0));
    }
}

fn last_execution(transport: &ScriptedTransport) -> Execution {
    transport
        .executions()
        .last()
        .cloned()
        .expect("at least one command ran")
}

fn chain_of(ids: &[&str]) -> FamilyChain {
    FamilyChain::new(ids.iter().copied().map(FamilyId::new).collect())
}

#[rstest]
fn registers_every_builtin_family() {
    let registry = builtin_registry().expect("registry");
    for family in ["linux", "debian", "ubuntu", "redhat", "alpine", "freebsd", "darwin", GENERIC] {
        assert!(registry.is_known(family), "{family}");
    }
    assert_eq!(registry.rules().len(), 7);
    assert_eq!(
        registry.capabilities_of("linux"),
        vec![
            "change_host_name",
            "halt",
            "insert_public_key",
            "mount_nfs_folder",
            "network_interfaces",
            "remove_public_key",
        ]
    );
}

#[rstest]
fn builtins_cannot_be_registered_twice() {
    let mut builder = RegistryBuilder::new(GENERIC);
    register_builtins(&mut builder).expect("first pass");
    assert!(register_builtins(&mut builder).is_err());
    assert!(builder.build().is_err());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn ubuntu_machines_resolve_through_debian(transport: ScriptedTransport) {
    answer(&transport, &[LINUX_PROBE, DEBIAN_PROBE, UBUNTU_PROBE, "/etc/hostname"]);
    let machine = machine(&transport);

    assert_eq!(
        machine.family_chain().await.expect("detected"),
        chain_of(&["ubuntu", "debian", "linux", GENERIC])
    );
    let changed = machine
        .capability("change_host_name", CapabilityArgs::new(vec![json!("db.example.com")]))
        .await
        .expect("debian provider");
    assert_eq!(changed, json!(true));

    let execution = last_execution(&transport);
    assert_eq!(execution.shell, "sudo -E -H bash -l");
    assert!(execution.command.contains("hostname db\n"), "{}", execution.command);
    assert!(execution.command.contains("/etc/mailname"), "{}", execution.command);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn host_name_changes_are_skipped_when_already_set(transport: ScriptedTransport) {
    answer(&transport, &["hostname | grep -qx db-1"]);
    let machine = machine(&transport).with_family("linux").expect("known");

    let changed = machine
        .capability("change_host_name", CapabilityArgs::new(vec![json!("db-1")]))
        .await
        .expect("linux provider");
    assert_eq!(changed, json!(false));
    assert_eq!(transport.commands(), vec!["hostname | grep -qx db-1"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn lists_interfaces_in_index_order(transport: ScriptedTransport) {
    transport.respond(
        "ls -1 /sys/class/net",
        Reply::exit(0).stdout("lo\neth10\neth1\nwlan0\neth0\n"),
    );
    let machine = machine(&transport).with_family("linux").expect("known");

    let devices = machine
        .capability("network_interfaces", CapabilityArgs::empty())
        .await
        .expect("interfaces");
    assert_eq!(devices, json!(["eth0", "eth1", "eth10", "wlan0"]));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn debian_networks_rewrite_the_managed_block(transport: ScriptedTransport) {
    answer(&transport, &[LINUX_PROBE, DEBIAN_PROBE, "/etc/network/interfaces"]);
    transport.respond("ls -1 /sys/class/net", Reply::exit(0).stdout("lo\neth0\neth1\n"));
    let machine = machine(&transport);

    let networks = json!([{
        "interface": 1,
        "type": "static",
        "ip": "192.168.56.10",
        "netmask": "255.255.255.0"
    }]);
    let configured = machine
        .capability("configure_networks", CapabilityArgs::new(vec![networks]))
        .await
        .expect("configured");
    assert_eq!(configured, json!(["eth1"]));

    let script = last_execution(&transport).command;
    for expected in [
        "#TETHER-BEGIN",
        "iface eth1 inet static",
        "address 192.168.56.10",
        "netmask 255.255.255.0",
        "#TETHER-END",
        "/sbin/ifdown eth1",
        "/sbin/ifup eth1",
    ] {
        assert!(script.contains(expected), "missing {expected} in {script}");
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn pinned_chains_only_search_the_pinned_family(transport: ScriptedTransport) {
    transport.respond("ls -1 /sys/class/net", Reply::exit(0).stdout("lo\neth0\n"));
    let machine = machine(&transport).with_family("redhat").expect("known");

    let err = machine
        .capability(
            "configure_networks",
            CapabilityArgs::new(vec![json!([{"interface": 3, "type": "dhcp"}])]),
        )
        .await
        .expect_err("network_interfaces lives on linux");
    assert!(
        matches!(&err, CapabilityError::CapabilityNotFound { capability, .. } if capability == "network_interfaces"),
        "{err}"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn out_of_range_interfaces_fail_on_detected_chains(transport: ScriptedTransport) {
    answer(&transport, &[LINUX_PROBE, "test -f /etc/redhat-release"]);
    transport.respond("ls -1 /sys/class/net", Reply::exit(0).stdout("lo\neth0\n"));
    let machine = machine(&transport);

    let err = machine
        .capability(
            "configure_networks",
            CapabilityArgs::new(vec![json!([{"interface": 3, "type": "dhcp"}])]),
        )
        .await
        .expect_err("only one interface");
    assert!(matches!(err, CapabilityError::Provider { .. }), "{err}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn redhat_networks_use_network_manager(transport: ScriptedTransport) {
    answer(&transport, &[LINUX_PROBE, "test -f /etc/redhat-release", "nmcli"]);
    transport.respond("ls -1 /sys/class/net", Reply::exit(0).stdout("eth0\neth1\n"));
    let machine = machine(&transport);

    let networks = json!([
        {"interface": 0, "type": "dhcp"},
        {"interface": 1, "type": "static", "ip": "10.1.0.4", "netmask": "255.255.0.0", "gateway": "10.1.0.1"}
    ]);
    let configured = machine
        .capability("configure_networks", CapabilityArgs::new(vec![networks]))
        .await
        .expect("configured");
    assert_eq!(configured, json!(["eth0", "eth1"]));

    let commands = transport.commands();
    let nmcli: Vec<&String> = commands.iter().filter(|c| c.starts_with("nmcli")).collect();
    assert_eq!(nmcli.len(), 2);
    assert!(nmcli[0].contains("ifname eth0 con-name tether-eth0 ipv4.method auto"));
    assert!(nmcli[1].contains("ipv4.method manual ipv4.addresses 10.1.0.4/16 ipv4.gateway 10.1.0.1"));
}

#[rstest]
#[case(json!("git"), "apk add --no-cache git")]
#[case(json!(["git", "curl"]), "apk add --no-cache git curl")]
#[tokio::test(start_paused = true)]
async fn alpine_installs_with_apk(
    transport: ScriptedTransport,
    #[case] packages: Value,
    #[case] expected: &str,
) {
    answer(&transport, &[LINUX_PROBE, ALPINE_PROBE, "apk add"]);
    let machine = machine(&transport);

    machine
        .capability("install_package", CapabilityArgs::new(vec![packages]))
        .await
        .expect("installed");
    assert_eq!(last_execution(&transport).command, expected);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn empty_package_lists_are_rejected(transport: ScriptedTransport) {
    let machine = machine(&transport).with_family("debian").expect("known");
    let err = machine
        .capability("install_package", CapabilityArgs::new(vec![json!([])]))
        .await
        .expect_err("nothing to install");
    assert!(matches!(err, CapabilityError::InvalidArgument { index: 0, .. }), "{err}");
    assert!(transport.commands().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn halt_tolerates_the_session_dropping(transport: ScriptedTransport) {
    let machine = machine(&transport).with_family("linux").expect("known");
    transport.fail_next_command(TransportError::Disconnected);

    let output = machine
        .capability("halt", CapabilityArgs::empty())
        .await
        .expect("a dropped session means the machine is going down");
    assert_eq!(output, Value::Null);
    assert_eq!(transport.commands(), vec!["shutdown -h now"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn halt_tolerates_a_missing_exit_status(transport: ScriptedTransport) {
    transport.respond("poweroff", Reply::without_exit_status());
    let machine = machine(&transport).with_family("alpine").expect("known");

    machine
        .capability("halt", CapabilityArgs::empty())
        .await
        .expect("alpine halt");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn halt_still_reports_refusals(transport: ScriptedTransport) {
    transport.respond("shutdown", Reply::exit(1).stderr("must be superuser\n"));
    let machine = machine(&transport).with_family("darwin").expect("known");

    let err = machine
        .capability("halt", CapabilityArgs::empty())
        .await
        .expect_err("refused");
    assert!(
        matches!(err, CapabilityError::Communicator(CommunicatorError::CommandFailed { exit_code: 1, .. })),
        "{err}"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn public_keys_are_managed_as_the_login_user(transport: ScriptedTransport) {
    answer(&transport, &["authorized_keys"]);
    let machine = machine(&transport).with_family("linux").expect("known");
    let key = json!("ssh-ed25519 AAAAC3Nza tether@host");

    machine
        .capability("insert_public_key", CapabilityArgs::new(vec![key.clone()]))
        .await
        .expect("inserted");
    machine
        .capability("remove_public_key", CapabilityArgs::new(vec![key]))
        .await
        .expect("removed");

    let executions = transport.executions();
    assert_eq!(executions.len(), 2);
    assert!(executions.iter().all(|execution| execution.shell == "bash -l"));
    assert!(executions[0].command.contains("'ssh-ed25519 AAAAC3Nza tether@host'"));
    assert!(executions[1].command.contains("grep -vxF"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn nfs_folders_are_mounted_one_by_one(transport: ScriptedTransport) {
    answer(&transport, &["mount -o"]);
    let machine = machine(&transport).with_family("linux").expect("known");

    let folders = json!([
        {"hostpath": "/srv/app", "guestpath": "/vagrant"},
        {"hostpath": "/srv/data", "guestpath": "/data", "nfs_version": 4, "udp": true}
    ]);
    let mounted = machine
        .capability(
            "mount_nfs_folder",
            CapabilityArgs::new(vec![json!("192.168.56.1"), folders]),
        )
        .await
        .expect("mounted");
    assert_eq!(mounted, json!(2));

    let commands = transport.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].starts_with("mkdir -p /vagrant\nmount -o vers=3 "));
    assert!(commands[1].contains("mount -o vers=4,udp "));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn freebsd_persists_the_host_name_with_sysrc(transport: ScriptedTransport) {
    answer(&transport, &["sysrc"]);
    let machine = machine(&transport).with_family("freebsd").expect("known");

    machine
        .capability("change_host_name", CapabilityArgs::new(vec![json!("db-1")]))
        .await
        .expect("renamed");
    assert_eq!(
        last_execution(&transport).command,
        "sysrc hostname=db-1\nhostname db-1"
    );
}
