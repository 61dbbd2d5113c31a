use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use pretty_assertions::assert_eq;
use shellport_core::RuntimeError;
use shellport_core::SessionId;
use shellport_core::SessionOutput;
use shellport_core::SessionRegistry;
use shellport_core::SignalKind;
use shellport_core::config::SessionConfig;
use tempfile::tempdir;

const DEADLINE: Duration = Duration::from_secs(10);

/// The pid still exists, zombies included. Used for processes this test
/// process is responsible for reaping.
fn pid_exists(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// The pid exists and is not a zombie. Orphans are reaped by init, which a
/// container may not run, so a zombie counts as stopped.
fn process_running(pid: libc::pid_t) -> bool {
    if !pid_exists(pid) {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .is_none_or(|(_, rest)| !rest.starts_with('Z')),
        Err(_) => true,
    }
}

/// Waits for a shell to write its pid to `path`.
async fn wait_for_pid(path: &Path) -> libc::pid_t {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if let Ok(raw) = std::fs::read_to_string(path)
            && let Ok(pid) = raw.trim().parse()
        {
            return pid;
        }
        assert!(Instant::now() < deadline, "no pid written to {}", path.display());
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while !done() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    done()
}

/// Registry whose sessions run `script` under `/bin/sh -c`.
fn script_registry(script: String, close_grace_ms: u64) -> SessionRegistry {
    SessionRegistry::new(SessionConfig {
        shell: "/bin/sh".to_string(),
        shell_args: vec!["-c".to_string(), script],
        close_grace_ms,
        ..SessionConfig::default()
    })
}

fn registry(ttl_seconds: u64) -> SessionRegistry {
    SessionRegistry::new(SessionConfig {
        ttl_seconds,
        shell: "/bin/bash".to_string(),
        shell_args: vec!["--noprofile".to_string(), "--norc".to_string()],
        close_grace_ms: 200,
        ..SessionConfig::default()
    })
}

/// Reads until `done` accepts the accumulated output or the deadline passes.
async fn read_until(
    registry: &SessionRegistry,
    id: &SessionId,
    done: impl Fn(&str, &SessionOutput) -> bool,
) -> (String, SessionOutput) {
    let deadline = Instant::now() + DEADLINE;
    let mut seen = String::new();
    loop {
        let last = registry.read(id).await;
        seen.push_str(&last.output);
        if done(&seen, &last) || Instant::now() >= deadline {
            return (seen, last);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn written_command_output_is_readable() {
    let registry = registry(300);
    let id = registry.create(None).await.expect("create session");

    assert!(registry.write(&id, "echo marker\n").await);
    let (seen, last) = read_until(&registry, &id, |seen, _| seen.contains("marker")).await;
    assert!(seen.contains("marker"), "output was {seen:?}");
    assert!(last.is_running);
    assert_eq!(last.exit_code, None);

    registry.close(&id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_starts_in_requested_directory() {
    let dir = tempdir().expect("tempdir");
    let canonical = dir.path().canonicalize().expect("canonicalize");
    let registry = registry(300);
    let id = registry
        .create(dir.path().to_str())
        .await
        .expect("create session");

    registry.write(&id, "pwd -P\n").await;
    let expected = canonical.display().to_string();
    let (seen, _) = read_until(&registry, &id, |seen, _| seen.contains(&expected)).await;
    assert!(seen.contains(&expected), "output was {seen:?}");

    registry.close(&id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exit_is_observed_and_kept_within_ttl() {
    let registry = registry(300);
    let id = registry.create(None).await.expect("create session");

    registry.write(&id, "echo bye; exit 3\n").await;
    let (seen, last) = read_until(&registry, &id, |seen, last| {
        !last.is_running && seen.contains("bye")
    })
    .await;
    assert!(!last.is_running);
    assert_eq!(last.exit_code, Some(3));
    assert!(seen.contains("bye"), "output was {seen:?}");

    let again = registry.read(&id).await;
    assert!(!again.is_running);
    assert_eq!(again.exit_code, Some(3));
    assert!(registry.has(&id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exited_session_is_reaped_after_ttl() {
    let registry = registry(0);
    let id = registry.create(None).await.expect("create session");
    let other = registry.create(None).await.expect("create session");

    registry.write(&id, "exit\n").await;
    let deadline = Instant::now() + DEADLINE;
    while registry.has(&id).await && Instant::now() < deadline {
        // Any registry call drives the sweep.
        registry.read(&other).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!registry.has(&id).await);
    assert_eq!(registry.read(&id).await, SessionOutput::empty());
    assert!(registry.has(&other).await);

    registry.close(&other).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_ids_are_harmless() {
    let registry = registry(300);
    let missing = SessionId::from("000000000000");

    assert_eq!(registry.read(&missing).await, SessionOutput::empty());
    assert!(!registry.write(&missing, "echo hi\n").await);
    assert!(!registry.signal(&missing, SignalKind::Interrupt).await);
    assert!(!registry.has(&missing).await);
    registry.close(&missing).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_directory_is_rejected_without_a_session() {
    let dir = tempdir().expect("tempdir");
    let missing = dir.path().join("missing");
    let registry = registry(300);

    let err = registry
        .create(missing.to_str())
        .await
        .expect_err("expected rejection");
    assert!(matches!(err, RuntimeError::InvalidWorkingDirectory { .. }));
    assert!(registry.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kill_signal_reaches_the_shell() {
    let registry = registry(300);
    let id = registry.create(None).await.expect("create session");

    assert!(registry.signal(&id, SignalKind::Kill).await);
    let (_, last) = read_until(&registry, &id, |_, last| !last.is_running).await;
    assert!(!last.is_running);
    assert_eq!(last.exit_code, Some(128 + libc::SIGKILL));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_reaches_foreground_sub_child() {
    let dir = tempdir().expect("tempdir");
    let child_file = dir.path().join("child.pid");
    let registry = script_registry(
        format!(
            "sh -c 'echo $$ > {child}; exec sleep 30'; sleep 30",
            child = child_file.display()
        ),
        200,
    );
    let id = registry.create(None).await.expect("create session");
    let child = wait_for_pid(&child_file).await;
    assert!(process_running(child));

    assert!(registry.signal(&id, SignalKind::Interrupt).await);
    assert!(
        wait_until(|| !process_running(child)).await,
        "sub-child survived SIGINT"
    );

    registry.close(&id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_kills_a_shell_that_ignores_hangup() {
    let dir = tempdir().expect("tempdir");
    let leader_file = dir.path().join("leader.pid");
    let registry = script_registry(
        format!(
            "trap '' HUP TERM; echo $$ > {leader}; while :; do sleep 1; done",
            leader = leader_file.display()
        ),
        500,
    );
    let id = registry.create(None).await.expect("create session");
    let leader = wait_for_pid(&leader_file).await;

    registry.close(&id).await;
    assert!(!registry.has(&id).await);
    // HUP and TERM are ignored; only the escalation after the grace period ends it.
    assert!(pid_exists(leader));
    // Reaped as well as killed: a zombie would still answer kill(pid, 0).
    assert!(wait_until(|| !pid_exists(leader)).await, "shell survived close");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_registry_kills_every_group_member() {
    let dir = tempdir().expect("tempdir");
    let leader_file = dir.path().join("leader.pid");
    let child_file = dir.path().join("child.pid");
    let registry = script_registry(
        format!(
            "trap '' HUP TERM; sleep 30 & echo $! > {child}; echo $$ > {leader}; wait",
            child = child_file.display(),
            leader = leader_file.display()
        ),
        200,
    );
    registry.create(None).await.expect("create session");
    let leader = wait_for_pid(&leader_file).await;
    let child = wait_for_pid(&child_file).await;

    drop(registry);
    assert!(!pid_exists(leader), "shell not reaped on drop");
    assert!(
        wait_until(|| !process_running(child)).await,
        "background child survived drop"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn output_after_exit_is_still_delivered() {
    let registry = registry(300);
    let id = registry.create(None).await.expect("create session");

    // The subshell outlives the shell and writes once the exit is visible.
    registry
        .write(&id, "(trap '' HUP; sleep 1; echo late-$((6*7))) & exit 0\n")
        .await;
    let (before_exit, last) = read_until(&registry, &id, |_, last| !last.is_running).await;
    assert!(!last.is_running);
    assert_eq!(last.exit_code, Some(0));
    assert!(!before_exit.contains("late-42"));

    let (after_exit, last) = read_until(&registry, &id, |seen, _| seen.contains("late-42")).await;
    assert!(after_exit.contains("late-42"), "output was {after_exit:?}");
    assert!(!last.is_running);
    assert_eq!(last.exit_code, Some(0));
    assert!(registry.has(&id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_output_arrives_without_loss() {
    const TOTAL: usize = 2 * 1024 * 1024;

    let registry = registry(300);
    let id = registry.create(None).await.expect("create session");
    // Octal escapes keep the echoed command line free of the counted byte
    // and of the end marker.
    registry
        .write(
            &id,
            &format!("head -c {TOTAL} /dev/zero | tr '\\0' '\\132'; echo DONE_$((1+1))\n"),
        )
        .await;

    let deadline = Instant::now() + Duration::from_secs(60);
    let mut count = 0usize;
    let mut tail = String::new();
    while !tail.contains("DONE_2") && Instant::now() < deadline {
        let chunk = registry.read(&id).await;
        count += chunk.output.bytes().filter(|b| *b == b'Z').count();
        tail.push_str(&chunk.output);
        let mut keep_from = tail.len().saturating_sub(16);
        while !tail.is_char_boundary(keep_from) {
            keep_from -= 1;
        }
        tail = tail.split_off(keep_from);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(tail.contains("DONE_2"));
    assert_eq!(count, TOTAL);

    registry.close(&id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_is_idempotent_and_removes_the_session() {
    let registry = registry(300);
    let id = registry.create(None).await.expect("create session");
    registry.write(&id, "sleep 30\n").await;

    registry.close(&id).await;
    assert!(!registry.has(&id).await);
    registry.close(&id).await;
    assert_eq!(registry.read(&id).await, SessionOutput::empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_split_output_exactly() {
    const EXPECTED: usize = 500;

    let registry = Arc::new(registry(300));
    let id = registry.create(None).await.expect("create session");
    // Octal escape keeps the echoed command line free of the counted byte.
    registry
        .write(&id, &format!("printf '\\132%.0s' $(seq 1 {EXPECTED})\n"))
        .await;

    let total = Arc::new(AtomicUsize::new(0));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let id = id.clone();
            let total = Arc::clone(&total);
            tokio::spawn(async move {
                let deadline = Instant::now() + DEADLINE;
                while total.load(Ordering::SeqCst) < EXPECTED && Instant::now() < deadline {
                    let chunk = registry.read(&id).await;
                    let count = chunk.output.bytes().filter(|b| *b == b'Z').count();
                    total.fetch_add(count, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        })
        .collect();
    for reader in readers {
        reader.await.expect("reader task");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let trailing = registry.read(&id).await;
    let total = total.load(Ordering::SeqCst) + trailing.output.bytes().filter(|b| *b == b'Z').count();
    assert_eq!(total, EXPECTED);

    registry.close(&id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweeper_reclaims_without_traffic() {
    let registry = Arc::new(SessionRegistry::new(SessionConfig {
        ttl_seconds: 0,
        sweep_interval_seconds: Some(1),
        shell: "/bin/sh".to_string(),
        shell_args: vec!["-c".to_string(), "exit 0".to_string()],
        ..SessionConfig::default()
    }));
    let id = registry.create(None).await.expect("create session");
    let sweeper = registry.spawn_sweeper().expect("sweeper configured");

    let deadline = Instant::now() + DEADLINE;
    while registry.has(&id).await && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!registry.has(&id).await);
    sweeper.abort();
}
