#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;

use common::{FakeConfig, session, session_with, test_config};
use ferrexpect::error::{Error, SessionError, TransportError};

const SCRIPT: &[u8] = b"#!/bin/sh\necho deployed\n";

#[tokio::test]
async fn test_transfer_over_session() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let fake = FakeConfig {
        fs_root: Some(remote.path().to_path_buf()),
        ..FakeConfig::default()
    };
    let mut session = session_with(fake, test_config());
    session.login().await.unwrap();

    let script = local.path().join("deploy.sh");
    std::fs::write(&script, SCRIPT).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o750)).unwrap();

    let mut transfer = session.transfer().await.unwrap();
    assert_eq!(transfer.put_file(&script, "/deploy.sh").await.unwrap(), 24);

    let uploaded = remote.path().join("deploy.sh");
    assert_eq!(std::fs::read(&uploaded).unwrap(), SCRIPT);
    assert_eq!(
        std::fs::metadata(&uploaded).unwrap().permissions().mode() & 0o777,
        0o750
    );

    let back = local.path().join("back.sh");
    assert_eq!(transfer.get_file("/deploy.sh", &back).await.unwrap(), 24);
    assert_eq!(std::fs::read(&back).unwrap(), SCRIPT);

    let tree = local.path().join("tree");
    std::fs::create_dir_all(tree.join("conf")).unwrap();
    std::fs::write(tree.join("conf/app.toml"), b"port = 80").unwrap();
    std::fs::create_dir(remote.path().join("srv")).unwrap();
    transfer.put_folder(&tree, "/srv", true).await.unwrap();
    assert_eq!(
        std::fs::read(remote.path().join("srv/conf/app.toml")).unwrap(),
        b"port = 80"
    );

    // the shell keeps working next to the file session
    let user = session.command("whoami").await.unwrap();
    assert_eq!(user.trim(), "lowly_pleb");

    session.exit().await.unwrap();
}

#[tokio::test]
async fn test_transfer_needs_connection() {
    let mut session = session();
    let err = session.transfer().await.err().unwrap();
    assert!(matches!(err, Error::Session(SessionError::NotConnected)));

    // the fake server has no filesystem configured
    session.login().await.unwrap();
    let err = session.transfer().await.err().unwrap();
    assert!(matches!(err, Error::Transport(TransportError::Sftp(_))));

    session.exit().await.unwrap();
}
