use super::*;
use crate::directive::{Direction, Directive, DirectiveOps, LiteralInput, Redirect};
use crate::errors::PlumbError;
use crate::runner::TargetRegistry;
use crate::test_support::serial_guard;
use nix::sys::signal::Signal;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn run_to_completion(mut child: Subprocess) -> Subprocess {
    let mut targets = TargetRegistry::default();
    child.run(&mut targets).unwrap();
    child.wait(false).unwrap();
    child
}

#[test]
fn subprocess_requires_a_program() {
    let err = Subprocess::new(Vec::new(), Vec::new(), Vec::new()).unwrap_err();
    assert!(matches!(err, PlumbError::Configuration(_)));
}

#[test]
fn subprocess_separates_program_and_arguments() {
    let child = Subprocess::new(args(&["echo", "a", "b"]), Vec::new(), Vec::new()).unwrap();
    assert_eq!(child.program(), Some("echo"));
    assert_eq!(child.args(), &["a".to_string(), "b".to_string()]);
    assert!(child.pid().is_none());
    assert!(child.status().is_none());
}

#[test]
fn subprocess_reports_exit_code() {
    let _guard = serial_guard();
    let child = Subprocess::new(args(&["sh", "-c", "exit 7"]), Vec::new(), Vec::new()).unwrap();
    let child = run_to_completion(child);

    assert_eq!(child.status(), Some(ExitStatus::Exited(7)));
    assert!(child.exec_error().is_none());
}

#[test]
fn subprocess_exec_failure_is_reported_not_raised() {
    let _guard = serial_guard();
    let child = Subprocess::new(
        args(&["/nonexistent/definitely-not-here"]),
        Vec::new(),
        Vec::new(),
    )
    .unwrap();
    let child = run_to_completion(child);

    let failure = child.exec_error().unwrap();
    assert_eq!(failure.error_kind, "ENOENT");
    assert_eq!(failure.origin[0], "execve");
    assert_eq!(child.status(), Some(ExitStatus::Exited(EXEC_FAILURE_STATUS)));
}

#[test]
fn subprocess_unresolvable_program_fails_in_child() {
    let _guard = serial_guard();
    let child = Subprocess::new(
        args(&["shellplumb-no-such-program"]),
        Vec::new(),
        Vec::new(),
    )
    .unwrap();
    let child = run_to_completion(child);

    let failure = child.exec_error().unwrap();
    assert_eq!(failure.error_kind, "ENOENT");
    assert_eq!(failure.origin[0], "resolve_program");
    assert!(failure.message.contains("shellplumb-no-such-program"));

    let err: PlumbError = failure.clone().into();
    assert!(matches!(err, PlumbError::Exec { .. }));
}

#[test]
fn subprocess_argv0_is_the_name_given() {
    let _guard = serial_guard();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");

    let child = Subprocess::new(
        args(&["sh", "-c", "echo $0", "custom-name"]),
        vec![Redirect::path(1, Direction::Write, &out).into()],
        Vec::new(),
    )
    .unwrap();
    run_to_completion(child);

    assert_eq!(fs::read_to_string(&out).unwrap(), "custom-name\n");
}

#[test]
fn subprocess_redirects_apply_in_order() {
    let _guard = serial_guard();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");

    // 2>&1 first: stderr keeps the original stdout, only stdout reaches the file.
    let child = Subprocess::new(
        args(&["sh", "-c", "echo out; echo err >&2"]),
        vec![
            Redirect::fd(2, Direction::Write, 1).into(),
            Redirect::path(1, Direction::Write, &out).into(),
        ],
        Vec::new(),
    )
    .unwrap();
    run_to_completion(child);
    assert_eq!(fs::read_to_string(&out).unwrap(), "out\n");

    let child = Subprocess::new(
        args(&["sh", "-c", "echo out; echo err >&2"]),
        vec![
            Redirect::path(1, Direction::Write, &out).into(),
            Redirect::fd(2, Direction::Write, 1).into(),
        ],
        Vec::new(),
    )
    .unwrap();
    run_to_completion(child);
    assert_eq!(fs::read_to_string(&out).unwrap(), "out\nerr\n");
}

#[test]
fn subprocess_append_keeps_existing_contents() {
    let _guard = serial_guard();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("log");
    fs::write(&out, "first\n").unwrap();

    let child = Subprocess::new(
        args(&["echo", "second"]),
        vec![Redirect::path(1, Direction::Append, &out).into()],
        Vec::new(),
    )
    .unwrap();
    run_to_completion(child);

    assert_eq!(fs::read_to_string(&out).unwrap(), "first\nsecond\n");
}

#[test]
fn subprocess_literal_input_reaches_stdin() {
    let _guard = serial_guard();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");

    let directives: Vec<Directive> = vec![
        LiteralInput::stdin("from a literal\n").into(),
        Redirect::path(1, Direction::Write, &out).into(),
    ];
    let mut targets = TargetRegistry::default();
    for directive in &directives {
        directive.register(&mut targets).unwrap();
    }

    let mut child = Subprocess::new(args(&["cat"]), directives, Vec::new()).unwrap();
    child.run(&mut targets).unwrap();
    assert_eq!(child.wait(false).unwrap(), Some(ExitStatus::Exited(0)));
    assert_eq!(fs::read_to_string(&out).unwrap(), "from a literal\n");
}

#[test]
fn subprocess_chdir_runs_before_exec() {
    let _guard = serial_guard();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");

    let child = Subprocess::new(
        args(&["pwd"]),
        vec![Redirect::path(1, Direction::Write, &out).into()],
        vec![PostFork::Chdir(dir.path().to_path_buf())],
    )
    .unwrap();
    run_to_completion(child);

    let expected = fs::canonicalize(dir.path()).unwrap();
    let printed = fs::read_to_string(&out).unwrap();
    assert_eq!(fs::canonicalize(printed.trim()).unwrap(), expected);
}

#[test]
fn subprocess_chdir_failure_is_an_exec_error() {
    let _guard = serial_guard();
    let child = Subprocess::new(
        args(&["true"]),
        Vec::new(),
        vec![PostFork::Chdir("/nonexistent/dir".into())],
    )
    .unwrap();
    let child = run_to_completion(child);

    let failure = child.exec_error().unwrap();
    assert_eq!(failure.origin[0], "chdir");
    assert_eq!(failure.error_kind, "ENOENT");
}

#[test]
fn subprocess_env_replaces_environment() {
    let _guard = serial_guard();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");

    let child = Subprocess::new(
        args(&["/bin/sh", "-c", "printf '%s|%s' \"$ONLY\" \"$HOME\""]),
        vec![Redirect::path(1, Direction::Write, &out).into()],
        Vec::new(),
    )
    .unwrap()
    .env(Some(vec![("ONLY".to_string(), "this".to_string())]));
    run_to_completion(child);

    assert_eq!(fs::read_to_string(&out).unwrap(), "this|");
}

#[test]
fn subprocess_callback_runs_in_child() {
    let _guard = serial_guard();
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("marker");
    let path = marker.clone();

    let callback: Callback = Arc::new(move || -> Result<(), CallbackError> {
        fs::write(&path, "ran")?;
        Ok(())
    });
    let child = run_to_completion(Subprocess::with_callback(callback, Vec::new(), Vec::new()));

    assert_eq!(child.status(), Some(ExitStatus::Exited(0)));
    assert!(child.exec_error().is_none());
    assert_eq!(fs::read_to_string(&marker).unwrap(), "ran");
}

#[test]
fn subprocess_callback_error_exits_one() {
    let _guard = serial_guard();
    let callback: Callback = Arc::new(|| -> Result<(), CallbackError> { Err("boom".into()) });
    let dir = TempDir::new().unwrap();
    let err = dir.path().join("err");

    let child = run_to_completion(Subprocess::with_callback(
        callback,
        vec![Redirect::path(2, Direction::Write, &err).into()],
        Vec::new(),
    ));

    assert_eq!(
        child.status(),
        Some(ExitStatus::Exited(CALLBACK_FAILURE_STATUS))
    );
    assert!(fs::read_to_string(&err).unwrap().contains("boom"));
}

#[test]
fn subprocess_callback_failure_ignores_stderr_lock_held_elsewhere() {
    let _guard = serial_guard();
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

    // Another thread owns the stderr lock across the fork, so the child
    // inherits it locked with no owner left to release it.
    let holder = std::thread::spawn(move || {
        let _stderr = std::io::stderr().lock();
        locked_tx.send(()).unwrap();
        let _ = release_rx.recv();
    });
    locked_rx.recv().unwrap();

    let dir = TempDir::new().unwrap();
    let err = dir.path().join("err");
    let callback: Callback = Arc::new(|| -> Result<(), CallbackError> { Err("locked".into()) });
    let mut child = Subprocess::with_callback(
        callback,
        vec![Redirect::path(2, Direction::Write, &err).into()],
        Vec::new(),
    );
    let mut targets = TargetRegistry::default();
    child.run(&mut targets).unwrap();

    let mut status = None;
    for _ in 0..500 {
        status = child.wait(true).unwrap();
        if status.is_some() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    if status.is_none() {
        let _ = child.kill(Signal::SIGKILL);
        let _ = child.wait(false);
    }

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    assert_eq!(status, Some(ExitStatus::Exited(CALLBACK_FAILURE_STATUS)));
    assert!(fs::read_to_string(&err).unwrap().contains("locked"));
}

#[test]
fn subprocess_wait_nonblocking_then_blocking() {
    let _guard = serial_guard();
    let mut targets = TargetRegistry::default();
    let mut child = Subprocess::new(args(&["sleep", "0.3"]), Vec::new(), Vec::new()).unwrap();
    child.run(&mut targets).unwrap();

    assert_eq!(child.wait(true).unwrap(), None);
    assert_eq!(child.wait(false).unwrap(), Some(ExitStatus::Exited(0)));
    // Cached from here on.
    assert_eq!(child.wait(true).unwrap(), Some(ExitStatus::Exited(0)));
}

#[test]
fn subprocess_run_is_idempotent() {
    let _guard = serial_guard();
    let mut targets = TargetRegistry::default();
    let mut child = Subprocess::new(args(&["true"]), Vec::new(), Vec::new()).unwrap();

    let first = child.run(&mut targets).unwrap();
    let second = child.run(&mut targets).unwrap();
    assert_eq!(first, second);
    child.wait(false).unwrap();
}

#[test]
fn subprocess_kill_reports_signal() {
    let _guard = serial_guard();
    let mut targets = TargetRegistry::default();
    let mut child = Subprocess::new(args(&["sleep", "30"]), Vec::new(), Vec::new()).unwrap();
    child.run(&mut targets).unwrap();

    child.kill(Signal::SIGTERM).unwrap();
    let status = child.wait(false).unwrap().unwrap();
    assert_eq!(status, ExitStatus::Signaled(Signal::SIGTERM));
    assert_eq!(status.code(), None);
    assert!(!status.success());

    // Reaped: killing again is a no-op.
    child.kill(Signal::SIGKILL).unwrap();
}

#[test]
fn subprocess_reap_race_is_reported() {
    let _guard = serial_guard();
    let mut targets = TargetRegistry::default();
    let mut child = Subprocess::new(args(&["true"]), Vec::new(), Vec::new()).unwrap();
    let pid = child.run(&mut targets).unwrap();

    nix::sys::wait::waitpid(pid, None).unwrap();

    let err = child.wait(false).unwrap_err();
    assert!(matches!(err, PlumbError::ReapRace { pid: raced } if raced == pid.as_raw()));
}

#[test]
fn subprocess_wait_before_run_is_a_state_error() {
    let mut child = Subprocess::new(args(&["true"]), Vec::new(), Vec::new()).unwrap();
    assert!(matches!(child.wait(false), Err(PlumbError::State(_))));
    assert!(matches!(child.kill(Signal::SIGTERM), Err(PlumbError::State(_))));
}

#[test]
fn subprocess_display_names_command() {
    let child = Subprocess::new(
        args(&["ls", "-l"]),
        vec![Redirect::fd(2, Direction::Write, 1).into()],
        Vec::new(),
    )
    .unwrap();
    let rendered = child.to_string();
    assert!(rendered.starts_with("Subprocess: command=\"ls\""));
    assert!(rendered.contains("2>&1"));
}

#[test]
fn exit_status_display() {
    assert_eq!(ExitStatus::Exited(3).to_string(), "exit code 3");
    assert_eq!(
        ExitStatus::Signaled(Signal::SIGKILL).to_string(),
        "signal SIGKILL"
    );
}

#[test]
fn exec_failure_from_errno() {
    let failure = ExecFailure::from_errno(nix::errno::Errno::EACCES, vec!["execve".into()]);
    assert_eq!(failure.error_kind, "EACCES");
    assert!(!failure.message.is_empty());
}
