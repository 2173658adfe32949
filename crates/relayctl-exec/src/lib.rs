//! Runs privileged system binaries (`wg`, `iptables-restore`, `ip`, ...) with
//! argument vectors, never shell strings, and captures their combined output.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::error::Elapsed;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
	Linux,
	MacOs,
	Windows,
	Other,
}

impl Os {
	pub fn current() -> Os {
		match std::env::consts::OS {
			"linux" => Os::Linux,
			"macos" => Os::MacOs,
			"windows" => Os::Windows,
			_ => Os::Other,
		}
	}
}

/// Combined stdout+stderr captured from a finished invocation.
#[derive(Debug, Clone, Default)]
pub struct Output {
	pub stdout: String,
	pub stderr: String,
	pub status: i32,
}

impl Output {
	/// Both streams concatenated, stdout first, the way a terminal would show them.
	pub fn combined(&self) -> String {
		let mut s = self.stdout.clone();
		s.push_str(&self.stderr);
		s
	}
}

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("command unsupported on this platform: {0:?}")]
	Unsupported(Os),
	#[error("empty argument vector")]
	EmptyArgv,
	#[error("command timed out after {0:?}")]
	TimedOut(Duration),
	#[error("failed to launch {program}: {source}")]
	Spawn {
		program: String,
		#[source]
		source: std::io::Error,
	},
	#[error("{program} exited with status {status}: {output}")]
	NonZeroExit {
		program: String,
		status: i32,
		output: String,
	},
}

/// Runs argv-form commands and captures their combined output. Implementations
/// must never accept or construct a shell command line.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
	/// `argv[0]` is the binary, the rest are its arguments. Enforces `timeout`
	/// (clamped to [1s, `MAX_TIMEOUT`]); on non-zero exit returns
	/// `ExecError::NonZeroExit` carrying the captured output.
	async fn execute(&self, argv: &[&str], timeout: Duration) -> Result<Output, ExecError>;

	/// Convenience wrapper using [`DEFAULT_TIMEOUT`].
	async fn execute_default(&self, argv: &[&str]) -> Result<Output, ExecError> {
		self.execute(argv, DEFAULT_TIMEOUT).await
	}

	/// Host OS tag, so callers can short-circuit unsupported platforms.
	fn os(&self) -> Os;
}

/// Real executor, backed by `tokio::process::Command`.
pub struct SystemExecutor {
	os: Os,
}

impl SystemExecutor {
	pub fn new() -> Self {
		SystemExecutor { os: Os::current() }
	}
}

impl Default for SystemExecutor {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl Executor for SystemExecutor {
	async fn execute(&self, argv: &[&str], timeout: Duration) -> Result<Output, ExecError> {
		let Some((program, args)) = argv.split_first() else {
			return Err(ExecError::EmptyArgv);
		};
		let clamped = timeout.clamp(Duration::from_secs(1), MAX_TIMEOUT);

		debug!(program, args = ?args, ?clamped, "executing command");

		let mut cmd = Command::new(program);
		cmd.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped());

		let fut = cmd.output();
		let output = tokio::time::timeout(clamped, fut)
			.await
			.map_err(|_: Elapsed| ExecError::TimedOut(clamped))?
			.map_err(|source| ExecError::Spawn {
				program: program.to_string(),
				source,
			})?;

		let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
		let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
		let status = output.status.code().unwrap_or(-1);

		if !output.status.success() {
			return Err(ExecError::NonZeroExit {
				program: program.to_string(),
				status,
				output: format!("{stdout}{stderr}"),
			});
		}

		Ok(Output {
			stdout,
			stderr,
			status,
		})
	}

	fn os(&self) -> Os {
		self.os
	}
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
	use std::collections::VecDeque;
	use std::sync::Mutex;

	use super::*;

	/// Records every invocation and replays canned responses in order.
	pub struct MockExecutor {
		os: Os,
		responses: Mutex<VecDeque<Result<Output, ExecError>>>,
		pub calls: Mutex<Vec<Vec<String>>>,
	}

	impl MockExecutor {
		pub fn new(os: Os) -> Self {
			MockExecutor {
				os,
				responses: Mutex::new(VecDeque::new()),
				calls: Mutex::new(Vec::new()),
			}
		}

		pub fn push_ok(&self, stdout: impl Into<String>) {
			self.responses.lock().unwrap().push_back(Ok(Output {
				stdout: stdout.into(),
				stderr: String::new(),
				status: 0,
			}));
		}

		pub fn push_err(&self, err: ExecError) {
			self.responses.lock().unwrap().push_back(Err(err));
		}
	}

	#[async_trait::async_trait]
	impl Executor for MockExecutor {
		async fn execute(&self, argv: &[&str], _timeout: Duration) -> Result<Output, ExecError> {
			self.calls
				.lock()
				.unwrap()
				.push(argv.iter().map(|s| s.to_string()).collect());
			self.responses
				.lock()
				.unwrap()
				.pop_front()
				.unwrap_or_else(|| {
					Ok(Output {
						stdout: String::new(),
						stderr: String::new(),
						status: 0,
					})
				})
		}

		fn os(&self) -> Os {
			self.os
		}
	}
}

#[cfg(test)]
mod tests {
	use super::mock::MockExecutor;
	use super::*;

	#[tokio::test]
	async fn system_executor_captures_stdout() {
		let exec = SystemExecutor::new();
		let out = exec.execute_default(&["echo", "hello"]).await.unwrap();
		assert_eq!(out.stdout.trim(), "hello");
	}

	#[tokio::test]
	async fn system_executor_reports_non_zero_exit() {
		let exec = SystemExecutor::new();
		let err = exec
			.execute_default(&["sh", "-c", "exit 3"])
			.await
			.unwrap_err();
		match err {
			ExecError::NonZeroExit { status, .. } => assert_eq!(status, 3),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn system_executor_enforces_timeout() {
		let exec = SystemExecutor::new();
		let err = exec
			.execute(&["sleep", "2"], Duration::from_secs(1))
			.await
			.unwrap_err();
		assert!(matches!(err, ExecError::TimedOut(_)));
	}

	#[tokio::test]
	async fn empty_argv_is_rejected() {
		let exec = SystemExecutor::new();
		let err = exec.execute_default(&[]).await.unwrap_err();
		assert!(matches!(err, ExecError::EmptyArgv));
	}

	#[tokio::test]
	async fn mock_executor_replays_canned_responses() {
		let mock = MockExecutor::new(Os::Linux);
		mock.push_ok("peer0  (none)\n");
		let out = mock.execute_default(&["wg", "show", "wg0"]).await.unwrap();
		assert_eq!(out.stdout, "peer0  (none)\n");
		assert_eq!(mock.calls.lock().unwrap().len(), 1);
	}
}
