//! Test execution inside an environment.
//!
//! Runs the configured test command as a child process scoped to the
//! environment's env vars and storage root, with a wall-clock timeout.
//! Timeout counts as failure; output and exit code are captured for the
//! proposal.

use std::process::Stdio;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::environment::Environment;
use super::proposal::TestResults;
use super::EvolutionError;

/// Runs `env.test_command` and captures the result. The child is killed on
/// timeout or cancellation.
pub async fn run_tests(
    env: &Environment,
    cancel: &CancellationToken,
) -> Result<TestResults, EvolutionError> {
    let Some(command) = &env.test_command else {
        return Err(EvolutionError::Config(format!(
            "{} environment has no test_command",
            env.kind
        )));
    };

    std::fs::create_dir_all(&env.storage_path).map_err(|e| EvolutionError::Io(e.to_string()))?;

    info!(env = %env.kind, command = command.as_str(), "running tests");
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&env.storage_path)
        .envs(&env.env_vars)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EvolutionError::Io(format!("spawn test command: {e}")))?;

    let started = Instant::now();

    // wait_with_output owns the child; losing the select drops the future
    // and kill_on_drop reaps the process.
    tokio::select! {
        _ = cancel.cancelled() => {
            Ok(TestResults {
                passed: false,
                exit_code: None,
                output: "test run cancelled".to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
            })
        }
        _ = tokio::time::sleep(env.test_timeout) => {
            Ok(TestResults {
                passed: false,
                exit_code: None,
                output: format!("test run exceeded {}ms", env.test_timeout.as_millis()),
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: true,
            })
        }
        output = child.wait_with_output() => {
            let output = output.map_err(|e| EvolutionError::Io(e.to_string()))?;
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(TestResults {
                passed: output.status.success(),
                exit_code: output.status.code(),
                output: text,
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: false,
            })
        }
    }
}
