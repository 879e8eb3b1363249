//! Process-signal behaviour. Each case re-runs this test binary as a child
//! process, because the signals are real and may end the process.

#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::time::Duration;

use container_runtime::mock::{ops, MockRuntime, ANY_TARGET};
use signal_hook::consts::{SIGINT, SIGTERM};
use test_environment::{RunOptions, SessionContext, TestEnvironment};

const SCENARIO_VAR: &str = "TESTENV_SIGNAL_SCENARIO";
/// Exit code of a child that outlived the signal it sent itself.
const SIGNAL_IGNORED: i32 = 3;

fn run_scenario(scenario: &str) -> ExitStatus {
    Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "signal_scenario", "--nocapture", "--test-threads=1"])
        .env(SCENARIO_VAR, scenario)
        .status()
        .unwrap()
}

fn terminated_by(status: ExitStatus, signal: i32) -> bool {
    status.signal() == Some(signal) || status.code() == Some(128 + signal)
}

/// Runs only inside a child started by the tests below.
#[tokio::test]
async fn signal_scenario() {
    let Ok(scenario) = std::env::var(SCENARIO_VAR) else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let env = TestEnvironment::builder(SessionContext::with_token("signals", "1"), Arc::new(runtime.clone()))
        .backup_dir(dir.path())
        .build()
        .await
        .unwrap();

    match scenario.as_str() {
        "after-cleanup" => {
            env.cleanup().await.unwrap();
            drop(env);
            signal_hook::low_level::raise(SIGINT).unwrap();
        }
        "after-failed-cleanup" => {
            runtime.fail_on(ops::REMOVE_NETWORK, ANY_TARGET);
            assert!(env.cleanup().await.is_err());
            signal_hook::low_level::raise(SIGINT).unwrap();
        }
        "live" => {
            env.run_dependency_container("redis", RunOptions::new()).await.unwrap();
            signal_hook::low_level::raise(SIGTERM).unwrap();
        }
        other => panic!("unknown scenario {}", other),
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    std::process::exit(SIGNAL_IGNORED);
}

#[test]
fn test_signal_after_cleanup_takes_default_action() {
    let status = run_scenario("after-cleanup");
    assert!(terminated_by(status, SIGINT), "child ended with {:?}", status);
}

#[test]
fn test_signal_after_failed_cleanup_takes_default_action() {
    let status = run_scenario("after-failed-cleanup");
    assert!(terminated_by(status, SIGINT), "child ended with {:?}", status);
}

#[test]
fn test_signal_while_live_cleans_up_and_exits_zero() {
    let status = run_scenario("live");
    assert_eq!(status.code(), Some(0), "child ended with {:?}", status);
}
