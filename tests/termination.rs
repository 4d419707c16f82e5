//! Fatal reports end the process, so each case re-runs this test binary with a scenario name in
//! the environment and checks how the child went away.
use namecrab::log::LogContext;
use namecrab::report::Reporter;
use namecrab::{invariant, require};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};
use std::sync::Arc;

const SCENARIO: &str = "NAMECRAB_TERMINATION_SCENARIO";

/// A log writer that panics on every write.
struct Exploding;

impl io::Write for Exploding {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        panic!("log writer failed")
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn hooked(core_ok: bool) -> Arc<Reporter> {
    let reporter = Arc::new(Reporter::new("namecrab", core_ok));
    reporter.install_panic_hook();
    reporter
}

fn run_scenario(name: &str) {
    match name {
        "early-fatal" => {
            Reporter::new("namecrab", false).early_fatal("boom");
        }
        "panic-exit" => {
            let _reporter = hooked(false);
            panic!("kaboom");
        }
        "panic-abort" => {
            let _reporter = hooked(true);
            panic!("kaboom");
        }
        "panicking-log-writer" => {
            let reporter = hooked(false);
            reporter.attach_log(LogContext::with_writer(|| Exploding, "namecrab=info").unwrap());
            let ready = std::hint::black_box(false);
            require!(ready);
        }
        "worker-thread" => {
            let _reporter = hooked(false);
            let worker = std::thread::spawn(|| panic!("worker gone"));
            let _ = worker.join();
        }
        "invariant" => {
            let _reporter = hooked(false);
            let pending = std::hint::black_box(3);
            invariant!(pending == 0);
        }
        other => panic!("no scenario {other}"),
    }
}

/// Entry point for the child process; does nothing in a normal test run.
#[test]
fn scenario_entry() {
    if let Ok(name) = std::env::var(SCENARIO) {
        run_scenario(&name);
        // Every scenario terminates; reaching this point is a failure of its own.
        std::process::exit(101);
    }
}

fn spawn(name: &str) -> (Output, String) {
    let out = Command::new(std::env::current_exe().unwrap())
        .args(["scenario_entry", "--exact", "--nocapture", "--test-threads=1"])
        .env(SCENARIO, name)
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out, stderr)
}

#[test]
fn early_fatal_exits_with_status_one() {
    let (out, stderr) = spawn("early-fatal");
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("namecrab: boom\n"), "{stderr}");
}

#[test]
fn panic_is_reported_and_exits() {
    let (out, stderr) = spawn("panic-exit");
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("PANIC(kaboom) failed"), "{stderr}");
}

#[test]
fn panic_aborts_when_core_dumps_are_allowed() {
    let (out, stderr) = spawn("panic-abort");
    assert_eq!(out.status.code(), None);
    assert_eq!(out.status.signal(), Some(libc::SIGABRT), "{stderr}");
    assert!(stderr.contains("PANIC(kaboom) failed"), "{stderr}");
}

#[test]
fn panicking_log_writer_still_terminates_once() {
    let (out, stderr) = spawn("panicking-log-writer");
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    let outer = stderr.find("REQUIRE(ready) failed").expect(&stderr);
    let nested = stderr.find("PANIC(log writer failed) failed").expect(&stderr);
    assert!(outer < nested, "{stderr}");
    assert_eq!(stderr.matches("REQUIRE(ready) failed").count(), 1, "{stderr}");
}

#[test]
fn panic_on_another_thread_ends_the_process() {
    let (out, stderr) = spawn("worker-thread");
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("PANIC(worker gone) failed"), "{stderr}");
}

#[test]
fn invariant_violation_names_its_kind() {
    let (out, stderr) = spawn("invariant");
    assert_eq!(out.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("INVARIANT(pending == 0) failed"), "{stderr}");
}
