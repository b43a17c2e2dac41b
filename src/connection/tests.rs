//! Unit tests for session reuse, reconnects and the connect retry policy.

use super::*;
use crate::exec::ShellSettings;
use crate::test_support::{Reply, ScriptedTransport};
use rstest::{fixture, rstest};

#[fixture]
fn transport() -> ScriptedTransport {
    ScriptedTransport::new()
}

fn policy(max_tries: u32) -> RetryPolicy {
    RetryPolicy {
        max_tries,
        retry_delay: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(15),
        settle_delay: Duration::from_millis(500),
    }
}

fn manager_with(
    transport: &ScriptedTransport,
    settings: ShellSettings,
    max_tries: u32,
) -> ConnectionManager<ScriptedTransport> {
    ConnectionManager::new(
        transport.clone(),
        ConnectionParams::new("10.0.0.5", 22, "vagrant"),
        ChannelExecutor::new(settings),
    )
    .with_retry_policy(policy(max_tries))
}

fn manager(transport: &ScriptedTransport) -> ConnectionManager<ScriptedTransport> {
    manager_with(transport, ShellSettings::default(), 3)
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn consecutive_commands_share_one_session(transport: ScriptedTransport) {
    let manager = manager(&transport);
    manager.run(Command::new("true")).await.expect("first");
    manager.run(Command::new("true")).await.expect("second");

    assert_eq!(transport.sessions_opened(), 1);
    let sessions: Vec<usize> = transport.executions().iter().map(|e| e.session).collect();
    assert_eq!(sessions, vec![1, 1]);
    assert_eq!(transport.probes(), 1, "reuse is gated by one probe");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn recently_used_sessions_skip_the_probe(transport: ScriptedTransport) {
    let manager = manager(&transport).with_idle_probe(Duration::from_secs(60));
    manager.run(Command::new("true")).await.expect("first");
    manager.run(Command::new("true")).await.expect("second");
    assert_eq!(transport.probes(), 0);
    assert_eq!(transport.sessions_opened(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_probe_reconnects_transparently(transport: ScriptedTransport) {
    let manager = manager(&transport);
    manager.run(Command::new("true")).await.expect("first");
    transport.break_current_session();

    let output = manager
        .run(Command::new("hostname"))
        .await
        .expect("stale session is replaced without surfacing the probe failure");
    assert!(output.success());
    assert_eq!(transport.sessions_opened(), 2);
    assert_eq!(transport.executions()[1].session, 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn closed_sessions_are_never_reused(transport: ScriptedTransport) {
    let manager = manager(&transport);
    manager.connect().await.expect("connect");
    assert!(manager.is_connected().await);
    manager.close().await.expect("close");
    assert!(!manager.is_connected().await);

    manager.run(Command::new("true")).await.expect("reconnects");
    assert_eq!(transport.sessions_opened(), 2);
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(5)]
#[tokio::test(start_paused = true)]
async fn transient_failures_stop_after_max_tries(
    transport: ScriptedTransport,
    #[case] max_tries: u32,
) {
    transport.fail_all_connects(TransportError::ConnectionRefused);
    let manager = manager_with(&transport, ShellSettings::default(), max_tries);

    let err = manager.connect().await.expect_err("never connects");
    assert_eq!(
        err,
        ConnectError::RetriesExhausted {
            host: String::from("10.0.0.5"),
            port: 22,
            attempts: max_tries,
            last: TransportError::ConnectionRefused,
        }
    );
    assert_eq!(
        transport.connect_attempts(),
        usize::try_from(max_tries).expect("small")
    );
}

#[rstest]
#[case(TransportError::AuthenticationFailed { username: String::from("vagrant") })]
#[case(TransportError::KeyTypeUnsupported {
    path: camino::Utf8PathBuf::from("/keys/id_dsa"),
    message: String::from("dsa"),
})]
#[tokio::test(start_paused = true)]
async fn terminal_failures_are_not_retried(
    transport: ScriptedTransport,
    #[case] failure: TransportError,
) {
    transport.push_connect_failure(failure.clone());
    let manager = manager_with(&transport, ShellSettings::default(), 5);

    let err = manager.connect().await.expect_err("terminal failure");
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(err.transport_error(), &failure);
    assert!(matches!(err, ConnectError::Terminal { .. }), "{err}");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn third_attempt_succeeds_with_one_settle_delay(transport: ScriptedTransport) {
    transport.push_connect_failure(TransportError::ConnectionRefused);
    transport.push_connect_failure(TransportError::ConnectionRefused);
    let manager = manager_with(&transport, ShellSettings::default(), 3);

    let started = Instant::now();
    manager.connect().await.expect("third attempt connects");
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(
        started.elapsed(),
        Duration::from_millis(2 * 1000 + 500),
        "two retry pauses plus exactly one settle delay"
    );

    manager.run(Command::new("true")).await.expect("reuse");
    assert_eq!(started.elapsed(), Duration::from_millis(2500));
    assert_eq!(transport.connect_attempts(), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn connect_timeouts_count_as_transient(transport: ScriptedTransport) {
    transport.delay_connects(Duration::from_secs(20));
    let manager = manager_with(&transport, ShellSettings::default(), 2);

    let err = manager.connect().await.expect_err("every attempt times out");
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(err.transport_error(), &TransportError::Timeout { seconds: 15 });
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn mid_command_failures_surface_without_retry(transport: ScriptedTransport) {
    let manager = manager(&transport);
    transport.fail_next_command(TransportError::ConnectionReset);

    let err = manager
        .run(Command::new("apt-get update"))
        .await
        .expect_err("in-flight failure surfaces");
    assert_eq!(
        err,
        CommunicatorError::Transport {
            command: String::from("apt-get update"),
            source: TransportError::ConnectionReset,
        }
    );
    assert_eq!(transport.commands(), vec![String::from("apt-get update")]);

    manager.run(Command::new("true")).await.expect("next call reconnects");
    assert_eq!(transport.sessions_opened(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn checked_commands_report_failures_with_output(transport: ScriptedTransport) {
    transport.respond(
        "false",
        Reply::exit(1).stdout("partial\n").stderr("boom\n"),
    );
    let manager = manager(&transport);

    let err = manager
        .run(Command::new("false"))
        .await
        .expect_err("nonzero exit under check");
    assert_eq!(
        err,
        CommunicatorError::CommandFailed {
            command: String::from("false"),
            exit_code: 1,
            stdout: String::from("partial\n"),
            stderr: String::from("boom\n"),
        }
    );

    let output = manager
        .run(Command::new("false").error_policy(ErrorPolicy::Ignore))
        .await
        .expect("ignored exit");
    assert_eq!(output.exit_code, 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn missing_exit_status_names_the_command(transport: ScriptedTransport) {
    transport.respond("shutdown", Reply::without_exit_status());
    let manager = manager(&transport);
    let err = manager
        .run(Command::new("shutdown -h now"))
        .await
        .expect_err("protocol failure");
    assert_eq!(
        err,
        CommunicatorError::MissingExitStatus {
            command: String::from("shutdown -h now"),
        }
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn forwarded_agent_socket_is_exported_into_sudo(transport: ScriptedTransport) {
    transport.respond(
        "printf $SSH_AUTH_SOCK",
        Reply::exit(0).stdout("\n/tmp/ssh-XYZ/agent.42"),
    );
    let settings = ShellSettings {
        forward_agent: true,
        ..ShellSettings::default()
    };
    let manager = manager_with(&transport, settings, 3);

    manager
        .run(Command::new("git clone repo").privileged(true))
        .await
        .expect("privileged command");

    let executions = transport.executions();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].shell, "bash -l");
    assert_eq!(executions[1].shell, "sudo -E -H bash -l");
    assert!(
        executions[1]
            .script
            .contains("export SSH_AUTH_SOCK=/tmp/ssh-XYZ/agent.42\n"),
        "{}",
        executions[1].script
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unprivileged_commands_skip_the_agent_query(transport: ScriptedTransport) {
    let settings = ShellSettings {
        forward_agent: true,
        ..ShellSettings::default()
    };
    let manager = manager_with(&transport, settings, 3);
    manager.run(Command::new("ls")).await.expect("runs");
    assert_eq!(transport.commands(), vec![String::from("ls")]);
}

#[cfg(unix)]
#[rstest]
#[tokio::test(start_paused = true)]
async fn insecure_keys_fail_before_any_attempt(transport: ScriptedTransport) {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().expect("tempdir");
    let key = camino::Utf8PathBuf::from_path_buf(dir.path().join("id_rsa")).expect("utf8");
    std::fs::write(&key, "key").expect("write key");
    std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o644)).expect("chmod");

    let manager = ConnectionManager::new(
        transport.clone(),
        ConnectionParams::new("10.0.0.5", 22, "vagrant").with_private_key(key.clone()),
        ChannelExecutor::new(ShellSettings::default()),
    )
    .with_key_repair(false);

    let err = manager.connect().await.expect_err("insecure key");
    assert_eq!(
        err.transport_error(),
        &TransportError::InsecureKeyPermissions {
            path: key,
            mode: 0o644
        }
    );
    assert_eq!(transport.connect_attempts(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn good_exit_codes_widen_what_counts_as_success(transport: ScriptedTransport) {
    transport.respond("grep -q", Reply::exit(1));
    let manager = manager(&transport);

    let output = manager
        .run(Command::new("grep -q tether /etc/hosts").good_exit([0, 1]))
        .await
        .expect("1 is accepted");
    assert_eq!(output.exit_code, 1);

    let err = manager
        .run(Command::new("true").good_exit([3]))
        .await
        .expect_err("0 is no longer accepted");
    assert!(
        matches!(err, CommunicatorError::CommandFailed { exit_code: 0, .. }),
        "{err}"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn ready_runs_an_empty_command(transport: ScriptedTransport) {
    let manager = manager(&transport);
    assert!(manager.ready().await.expect("ready"));
    assert_eq!(transport.commands(), vec![String::new()]);
    assert!(manager.is_connected().await);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_targets_are_not_ready(transport: ScriptedTransport) {
    transport.fail_all_connects(TransportError::HostUnreachable);
    let manager = manager(&transport);
    assert!(!manager.ready().await.expect("not an error"));
    assert_eq!(transport.connect_attempts(), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn shells_rejecting_the_empty_command_are_invalid(transport: ScriptedTransport) {
    transport.with_default_exit(127);
    let manager = manager(&transport);

    let err = manager.wait_for_ready(Duration::from_secs(30)).await.expect_err("bad shell");
    assert_eq!(
        err,
        CommunicatorError::InvalidShell {
            shell: String::from("bash -l"),
            exit_code: 127,
        }
    );
    assert_eq!(transport.connect_attempts(), 1, "an invalid shell is not waited out");
}

#[rstest]
#[case(TransportError::ConnectionRefused)]
#[case(TransportError::AuthenticationFailed { username: String::from("vagrant") })]
#[tokio::test(start_paused = true)]
async fn waiting_retries_until_the_target_answers(
    transport: ScriptedTransport,
    #[case] failure: TransportError,
) {
    transport.push_connect_failure(failure.clone());
    transport.push_connect_failure(failure);
    let manager = manager_with(&transport, ShellSettings::default(), 5);

    let started = Instant::now();
    let ready = manager
        .wait_for_ready(Duration::from_secs(10))
        .await
        .expect("third check succeeds");
    assert!(ready);
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(
        started.elapsed(),
        Duration::from_millis(2 * 1000 + 500),
        "two check intervals plus one settle delay"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn waiting_gives_up_at_the_deadline(transport: ScriptedTransport) {
    transport.fail_all_connects(TransportError::ConnectionRefused);
    let manager = manager(&transport);

    let started = Instant::now();
    let ready = manager
        .wait_for_ready(Duration::from_millis(2500))
        .await
        .expect("a deadline is not an error");
    assert!(!ready);
    assert_eq!(started.elapsed(), Duration::from_millis(2500));
    assert_eq!(transport.connect_attempts(), 3, "one attempt per second");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn waiting_stops_on_unusable_keys(transport: ScriptedTransport) {
    let failure = TransportError::KeyTypeUnsupported {
        path: camino::Utf8PathBuf::from("/keys/id_dsa"),
        message: String::from("dsa"),
    };
    transport.push_connect_failure(failure.clone());
    let manager = manager(&transport);

    let err = manager
        .wait_for_ready(Duration::from_secs(30))
        .await
        .expect_err("waiting cannot fix the key");
    let CommunicatorError::Connect(connect) = err else {
        panic!("expected a connect error, got {err:?}");
    };
    assert_eq!(connect.transport_error(), &failure);
}
