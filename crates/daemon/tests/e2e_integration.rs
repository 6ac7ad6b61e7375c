//! End-to-end tests driving the real `expect-helper` through the client
//! library.
//!
//! These tests verify complete flows:
//! - Startup handshake and failure cleanup
//! - Input, output and reader fan-out
//! - Shell command helpers
//! - Liveness, attach and teardown

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use client::{
    run_fg, Config, ExpectError, Session, ShellSession, Signal, TerminalMode,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep, timeout, Instant};

const SHELL: &str = "env TERM=dumb PS1='$ ' /bin/bash --norc --noprofile";
const WAIT: Duration = Duration::from_secs(10);

/// Create a test configuration with a temporary base directory.
fn create_test_config() -> (Config, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.session.base_dir = temp_dir.path().to_path_buf();
    config.session.poll_interval_ms = 20;
    config.helper.path = Some(PathBuf::from(env!("CARGO_BIN_EXE_expect-helper")));
    config.helper.log_level = "debug".to_string();
    (config, temp_dir)
}

fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

fn fake_helper(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-helper");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn wait_until_dead(session: &Session) {
    let deadline = Instant::now() + WAIT;
    while session.is_alive() {
        assert!(Instant::now() < deadline, "session still alive");
        sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_spawn_creates_session_directory() {
    let (config, temp_dir) = create_test_config();

    let mut session = Session::spawn(&config, "sleep 30", false, &[]).await.unwrap();

    let layout = session.layout().clone();
    assert!(layout.dir().starts_with(temp_dir.path()));
    assert!(layout.input_pipe().exists());
    assert!(layout.control_pipe().exists());
    assert!(session.get_pid().is_some());
    assert!(session.is_alive());

    session.close().await.unwrap();
    assert!(!layout.dir().exists());
}

#[tokio::test]
async fn test_startup_timeout_cleans_up() {
    let (mut config, temp_dir) = create_test_config();
    let bin_dir = TempDir::new().unwrap();
    config.helper.path = Some(fake_helper(bin_dir.path(), "exec sleep 30"));
    config.session.handshake_timeout_ms = 300;

    let started = Instant::now();
    let err = Session::spawn(&config, "true", false, &[]).await.unwrap_err();

    assert!(matches!(err, ExpectError::StartupFailed { .. }), "{err}");
    assert!(started.elapsed() < WAIT);
    assert_eq!(entries(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_helper_exiting_early_fails_startup() {
    let (mut config, temp_dir) = create_test_config();
    let bin_dir = TempDir::new().unwrap();
    config.helper.path = Some(fake_helper(bin_dir.path(), "echo broken; exit 1"));

    let err = Session::spawn(&config, "true", false, &[]).await.unwrap_err();

    match err {
        ExpectError::StartupFailed { reason, .. } => assert!(reason.contains("broken"), "{reason}"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(entries(temp_dir.path()), 0);
}

#[tokio::test]
async fn test_long_command_runs_from_script() {
    let (config, _temp_dir) = create_test_config();
    let payload = "x".repeat(400);
    let command = format!("printf '%s\\n' {payload}");

    let mut session = Session::spawn(&config, &command, false, &[]).await.unwrap();

    assert!(session.layout().command_script().exists());
    assert_eq!(session.get_status().await.unwrap(), Some(0));
    assert!(session.get_output().await.unwrap().contains(&payload));
    session.close().await.unwrap();
}

// =============================================================================
// Reading
// =============================================================================

#[tokio::test]
async fn test_reads_do_not_redeliver_output() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(
        &config,
        "printf 'one\\n'; sleep 0.5; printf 'two\\n'; sleep 30",
        false,
        &[],
    )
    .await
    .unwrap();

    let (index, first) = session.read_until_output_matches(&["one"], WAIT).await.unwrap();
    assert_eq!(index, 0);
    assert!(first.contains("one"));

    let (index, second) = session
        .read_until_output_matches(&["one", "two"], WAIT)
        .await
        .unwrap();
    assert_eq!(index, 1);
    assert!(!second.contains("one"));

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_read_until_times_out() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "sleep 30", false, &[]).await.unwrap();

    let started = Instant::now();
    let err = session
        .read_until_output_matches(&["never"], Duration::from_millis(300))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(300));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_read_until_reports_termination() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "printf 'bye\\n'; exit 3", false, &[])
        .await
        .unwrap();

    let err = session
        .read_until_output_matches(&["never"], WAIT)
        .await
        .unwrap_err();

    match err {
        ExpectError::ProcessTerminated { status, output, .. } => {
            assert_eq!(status, Some(3));
            assert!(output.contains("bye"));
        }
        other => panic!("unexpected error: {other}"),
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_slow_reader_sees_every_byte() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "seq 1 20000", false, &["slow"])
        .await
        .unwrap();
    let mut reader = session.take_reader("slow").unwrap();

    sleep(Duration::from_millis(200)).await;
    let mut received = Vec::new();
    timeout(WAIT, reader.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(session.get_status().await.unwrap(), Some(0));
    let logged = session.get_output().await.unwrap();
    assert_eq!(received, logged.as_bytes());
    assert!(logged.ends_with("20000\n"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_reader_drained_after_exit_beyond_fifo_capacity() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "seq 1 300000", false, &["late"])
        .await
        .unwrap();
    let mut reader = session.take_reader("late").unwrap();

    // the child is gone and the helper has released the session
    assert_eq!(session.get_status().await.unwrap(), Some(0));
    assert!(!session.server_running());
    sleep(Duration::from_millis(1500)).await;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = timeout(WAIT, reader.read(&mut buf)).await.unwrap().unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
        sleep(Duration::from_millis(5)).await;
    }

    let logged = session.get_output().await.unwrap();
    assert!(logged.len() > 1_000_000);
    assert_eq!(received, logged.as_bytes());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_line_tail_reports_lines_and_status() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "printf 'a\\nb\\n'; exit 5", false, &["lines"])
        .await
        .unwrap();

    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
    session
        .attach_line_tail(
            "lines",
            "> ",
            move |line| sink.lock().unwrap().push(line.to_string()),
            move |status| {
                let _ = exit_tx.send(status);
            },
        )
        .unwrap();

    let status = timeout(WAIT, exit_rx).await.unwrap().unwrap();
    assert_eq!(status, 5);
    assert_eq!(
        *lines.lock().unwrap(),
        vec![
            "> a".to_string(),
            "> b".to_string(),
            "> (Process terminated with status 5)".to_string(),
        ]
    );
    session.close().await.unwrap();
}

// =============================================================================
// Input and terminal control
// =============================================================================

#[tokio::test]
async fn test_sendline_reaches_child() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "read line; echo got:$line", false, &[])
        .await
        .unwrap();

    session.sendline("hello").await.unwrap();
    session
        .read_until_output_matches(&["got:hello"], WAIT)
        .await
        .unwrap();
    assert_eq!(session.get_status().await.unwrap(), Some(0));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_raw_mode_delivers_partial_lines() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "cat", false, &[]).await.unwrap();

    session.send_control(TerminalMode::Raw).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    session.send("yo").await.unwrap();

    session.read_until_output_matches(&["yo"], WAIT).await.unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_ctrl_c_interrupts_child() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "cat", false, &[]).await.unwrap();

    session.send_ctrl_char('c').await.unwrap();
    let err = session
        .read_until_output_matches(&["never"], WAIT)
        .await
        .unwrap_err();

    assert!(err.is_terminated(), "{err}");
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_passive_session_rejects_input() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn_passive(&config, "sleep 30", &[]).await.unwrap();

    assert!(!session.layout().input_pipe().exists());
    let err = session.sendline("ignored").await.unwrap_err();
    assert!(matches!(err, ExpectError::NotInteractive(_)));
    session.close().await.unwrap();
}

// =============================================================================
// Shell sessions
// =============================================================================

#[tokio::test]
async fn test_shell_cmd_status() {
    let (config, _temp_dir) = create_test_config();
    let mut shell = ShellSession::spawn(&config, SHELL, false).await.unwrap();

    assert_eq!(shell.cmd_status("true", WAIT).await.unwrap(), 0);
    assert_eq!(shell.cmd_status("false", WAIT).await.unwrap(), 1);

    let err = shell.cmd("exit_code_of() { return 7; }; exit_code_of", WAIT).await.unwrap_err();
    assert!(matches!(err, ExpectError::ShellCommand { status: 7, .. }), "{err}");

    shell.close().await.unwrap();
}

#[tokio::test]
async fn test_shell_cmd_output() {
    let (config, _temp_dir) = create_test_config();
    let mut shell = ShellSession::spawn(&config, SHELL, false).await.unwrap();

    let output = shell.cmd_output("echo hello", WAIT).await.unwrap();
    assert!(output.lines().any(|line| line.trim() == "hello"), "{output:?}");

    let output = shell.cmd_output_safe("echo again", WAIT).await.unwrap();
    assert!(output.lines().any(|line| line.trim() == "again"), "{output:?}");

    shell.close().await.unwrap();
}

#[tokio::test]
async fn test_shell_custom_status_test_command() {
    let (config, _temp_dir) = create_test_config();
    let mut shell = ShellSession::spawn(&config, SHELL, false).await.unwrap();

    shell.set_status_test_command("printf 'status %d\\n' $?");
    assert_eq!(shell.cmd_status("false", WAIT).await.unwrap(), 1);
    assert_eq!(shell.cmd_status("(exit 4)", WAIT).await.unwrap(), 4);

    // a status command printing no number cannot be parsed
    shell.set_status_test_command("true");
    let err = shell.cmd_status("true", WAIT).await.unwrap_err();
    assert!(matches!(err, ExpectError::ShellStatus { .. }), "{err}");

    shell.close().await.unwrap();
}

#[tokio::test]
async fn test_shell_cmd_ignoring_errors() {
    let (config, _temp_dir) = create_test_config();
    let mut shell = ShellSession::spawn(&config, SHELL, false).await.unwrap();

    let output = shell.cmd_ignoring_errors("echo fine", WAIT).await.unwrap();
    assert!(output.unwrap().lines().any(|line| line.trim() == "fine"));

    assert_eq!(shell.cmd_ignoring_errors("false", WAIT).await.unwrap(), None);
    assert_eq!(
        shell
            .cmd_ignoring_errors("sleep 5", Duration::from_millis(300))
            .await
            .unwrap(),
        None
    );

    shell.close().await.unwrap();
}

#[tokio::test]
async fn test_shell_exit_ends_liveness() {
    let (config, _temp_dir) = create_test_config();
    let mut shell = ShellSession::spawn(&config, SHELL, false).await.unwrap();

    assert!(shell.is_alive());
    assert!(shell.is_responsive(WAIT).await);

    shell.sendline("exit").await.unwrap();
    wait_until_dead(&shell).await;

    assert!(!shell.is_responsive(Duration::from_millis(500)).await);
    assert_eq!(shell.get_status().await.unwrap(), Some(0));
    shell.close().await.unwrap();
}

#[tokio::test]
async fn test_partial_character_flushed_on_termination() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, r"printf 'x\342\202'; exit 2", false, &[])
        .await
        .unwrap();

    let err = session
        .read_until_output_matches(&["never"], WAIT)
        .await
        .unwrap_err();
    match err {
        ExpectError::ProcessTerminated { status, output, .. } => {
            assert_eq!(status, Some(2));
            assert_eq!(output, "x\u{FFFD}");
        }
        other => panic!("unexpected error: {other}"),
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_stripped_output_and_encoding() {
    let (mut config, _temp_dir) = create_test_config();
    config.session.encoding = "iso-8859-2".to_string();
    let mut session = Session::spawn(
        &config,
        r"printf '\033[1;31mred\033[0m \261\n'",
        false,
        &[],
    )
    .await
    .unwrap();

    assert_eq!(session.get_status().await.unwrap(), Some(0));
    assert_eq!(session.get_output().await.unwrap(), "\x1b[1;31mred\x1b[0m ą\n");
    assert_eq!(session.get_stripped_output().await.unwrap(), "red ą\n");
    let (_, text) = session
        .read_until_output_matches(&["ą"], WAIT)
        .await
        .unwrap();
    assert!(text.ends_with("ą\n"));
    session.close().await.unwrap();
}

// =============================================================================
// Attach and teardown
// =============================================================================

#[tokio::test]
async fn test_attach_to_running_session() {
    let (config, _temp_dir) = create_test_config();
    let mut owner = Session::spawn(&config, "cat", true, &[]).await.unwrap();

    let mut attach_config = config.clone();
    attach_config.session.auto_close = false;
    let mut attached = Session::attach(&attach_config, owner.id().as_str(), true, &[])
        .await
        .unwrap();
    assert!(attached.echo());

    attached.sendline("ping").await.unwrap();
    attached.read_until_output_matches(&["ping"], WAIT).await.unwrap();
    owner.read_until_output_matches(&["ping"], WAIT).await.unwrap();
    drop(attached);

    assert!(owner.is_alive());
    owner.close().await.unwrap();
}

#[tokio::test]
async fn test_attach_to_missing_session() {
    let (config, _temp_dir) = create_test_config();

    let err = Session::attach(&config, "deadbeef", false, &[]).await.unwrap_err();
    assert!(matches!(err, ExpectError::LockUnavailable(_)));
}

#[tokio::test]
async fn test_kill_and_close_are_idempotent() {
    let (config, _temp_dir) = create_test_config();
    let mut session = Session::spawn(&config, "sleep 30", false, &[]).await.unwrap();
    let dir = session.layout().dir().to_path_buf();

    session.kill(Signal::SIGKILL);
    session.kill(Signal::SIGKILL);
    wait_until_dead(&session).await;

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert!(session.is_closed());
    assert!(!dir.exists());
    assert!(session.sendline("late").await.is_err());
}

#[tokio::test]
async fn test_keep_files_leaves_log() {
    let (mut config, _temp_dir) = create_test_config();
    config.session.keep_files = true;
    let mut session = Session::spawn(&config, "printf 'kept\\n'", false, &[])
        .await
        .unwrap();

    assert_eq!(session.get_status().await.unwrap(), Some(0));
    session.close().await.unwrap();

    let layout = session.layout();
    assert_eq!(std::fs::read_to_string(layout.output_file()).unwrap(), "kept\n");
    assert_eq!(layout.read_status(), Some(0));
    assert!(layout.server_log().exists());
}

#[tokio::test]
async fn test_run_fg() {
    let (config, _temp_dir) = create_test_config();

    let (status, output) = run_fg(&config, "printf 'fg\\n'; exit 2", WAIT).await.unwrap();
    assert_eq!(status, Some(2));
    assert_eq!(output, "fg\n");

    let (status, _) = run_fg(&config, "sleep 30", Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(status, None);
}
