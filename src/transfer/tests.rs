//! Unit tests for SCP uploads and downloads against the in-memory peer.

use super::*;
use crate::test_support::ScriptedTransport;
use crate::transport::{ConnectionParams, Session, Transport};
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn transport() -> ScriptedTransport {
    ScriptedTransport::new()
}

#[fixture]
fn workdir() -> (TempDir, Utf8PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    (dir, root)
}

async fn channel(transport: &ScriptedTransport) -> Box<dyn RemoteChannel> {
    let session = transport
        .connect(&ConnectionParams::new("box", 22, "root"))
        .await
        .expect("connect");
    session.open_channel().await.expect("channel")
}

#[rstest]
#[tokio::test]
async fn uploads_a_single_file(transport: ScriptedTransport, workdir: (TempDir, Utf8PathBuf)) {
    let (_guard, root) = workdir;
    let local = root.join("motd");
    std::fs::write(&local, "hello from the host\n").expect("write");

    let mut chan = channel(&transport).await;
    upload(chan.as_mut(), &local, "/etc/motd")
        .await
        .expect("upload succeeds");

    let (_, contents) = transport.remote_file("/etc/motd").expect("file stored");
    assert_eq!(contents, b"hello from the host\n");
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn upload_preserves_permission_bits(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    use std::os::unix::fs::PermissionsExt;

    let (_guard, root) = workdir;
    let local = root.join("run.sh");
    std::fs::write(&local, "#!/bin/sh\n").expect("write");
    std::fs::set_permissions(&local, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let mut chan = channel(&transport).await;
    upload(chan.as_mut(), &local, "/usr/local/bin/run.sh")
        .await
        .expect("upload succeeds");

    let (mode, _) = transport
        .remote_file("/usr/local/bin/run.sh")
        .expect("file stored");
    assert_eq!(mode, 0o755);
}

#[rstest]
#[tokio::test]
async fn uploads_directories_recursively(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    let local = root.join("site");
    std::fs::create_dir_all(local.join("assets")).expect("mkdir");
    std::fs::write(local.join("index.html"), "<h1>hi</h1>").expect("write");
    std::fs::write(local.join("assets").join("app.js"), "run()").expect("write");

    let mut chan = channel(&transport).await;
    upload(chan.as_mut(), &local, "/srv/site")
        .await
        .expect("recursive upload succeeds");

    assert!(transport.has_remote_dir("/srv/site"));
    assert!(transport.has_remote_dir("/srv/site/assets"));
    assert_eq!(
        transport.remote_file("/srv/site/index.html").map(|(_, c)| c),
        Some(b"<h1>hi</h1>".to_vec())
    );
    assert_eq!(
        transport.remote_file("/srv/site/assets/app.js").map(|(_, c)| c),
        Some(b"run()".to_vec())
    );
}

#[rstest]
#[tokio::test]
async fn upload_into_existing_directory_keeps_file_name(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    let local = root.join("key.pub");
    std::fs::write(&local, "ssh-ed25519 AAAA").expect("write");
    transport.put_remote_dir("/tmp");

    let mut chan = channel(&transport).await;
    upload(chan.as_mut(), &local, "/tmp").await.expect("upload");
    assert!(transport.remote_file("/tmp/key.pub").is_some());
}

#[rstest]
#[tokio::test]
async fn rejected_writes_are_permission_denied(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    let local = root.join("shadow");
    std::fs::write(&local, "x").expect("write");
    transport.deny_path("/etc/");

    let mut chan = channel(&transport).await;
    let err = upload(chan.as_mut(), &local, "/etc/shadow")
        .await
        .expect_err("write is rejected");
    assert_eq!(
        err,
        TransferError::PermissionDenied {
            from: local.to_string(),
            to: String::from("/etc/shadow"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn missing_scp_is_tool_unavailable(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    let local = root.join("file");
    std::fs::write(&local, "x").expect("write");
    transport.without_scp();

    let mut chan = channel(&transport).await;
    let err = upload(chan.as_mut(), &local, "/tmp/file")
        .await
        .expect_err("no scp");
    assert_eq!(
        err,
        TransferError::TransferToolUnavailable {
            tool: String::from("scp"),
            exit_code: 127,
        }
    );

    let mut chan = channel(&transport).await;
    let err = download(chan.as_mut(), "/tmp/file", &root.join("copy"))
        .await
        .expect_err("no scp");
    assert!(matches!(err, TransferError::TransferToolUnavailable { .. }), "{err}");
}

#[rstest]
#[tokio::test]
async fn missing_local_file_is_a_local_error(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    let mut chan = channel(&transport).await;
    let err = upload(chan.as_mut(), &root.join("absent"), "/tmp/absent")
        .await
        .expect_err("nothing to read");
    assert!(matches!(err, TransferError::LocalIo { .. }), "{err}");
}

#[rstest]
#[tokio::test]
async fn downloads_a_single_file(transport: ScriptedTransport, workdir: (TempDir, Utf8PathBuf)) {
    let (_guard, root) = workdir;
    transport.put_remote_file("/var/log/syslog", 0o640, b"line one\nline two\n".to_vec());
    let local = root.join("syslog");

    let mut chan = channel(&transport).await;
    download(chan.as_mut(), "/var/log/syslog", &local)
        .await
        .expect("download succeeds");
    assert_eq!(
        std::fs::read_to_string(&local).expect("read"),
        "line one\nline two\n"
    );
}

#[rstest]
#[tokio::test]
async fn unreadable_remote_files_are_permission_denied(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    transport.put_remote_file("/root/secret", 0o600, b"s".to_vec());
    transport.deny_path("/root");

    let mut chan = channel(&transport).await;
    let err = download(chan.as_mut(), "/root/secret", &root.join("secret"))
        .await
        .expect_err("denied");
    assert!(matches!(err, TransferError::PermissionDenied { .. }), "{err}");
}

#[rstest]
#[tokio::test]
async fn missing_remote_files_are_remote_errors(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    let mut chan = channel(&transport).await;
    let err = download(chan.as_mut(), "/nope", &root.join("nope"))
        .await
        .expect_err("absent");
    assert_eq!(
        err,
        TransferError::Remote {
            path: String::from("/nope"),
            message: String::from("scp: /nope: No such file or directory"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn downloading_a_directory_is_a_protocol_error(
    transport: ScriptedTransport,
    workdir: (TempDir, Utf8PathBuf),
) {
    let (_guard, root) = workdir;
    transport.put_remote_dir("/etc");
    let mut chan = channel(&transport).await;
    let err = download(chan.as_mut(), "/etc", &root.join("etc"))
        .await
        .expect_err("directories are not downloadable");
    assert!(matches!(err, TransferError::Protocol { .. }), "{err}");
}
