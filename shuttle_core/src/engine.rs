use crate::config::{CommandEngineSettings, ConfigInputDelivery};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Status reported for a failure whose own code would read as success on the wire.
pub const GENERIC_FAILURE_STATUS: i32 = 1;

/// What an engine reports after running one program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Exception, parse error, runtime error, or anything else the engine
    /// considers a failed run. `code` is engine specific.
    Failure { code: i32 },
}

impl Outcome {
    /// Maps the outcome onto the status vocabulary of the protocol.
    ///
    /// Only the low byte of a status travels to the fuzzer, so failures whose
    /// code has a zero low byte are reported as [`GENERIC_FAILURE_STATUS`].
    pub fn status(self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure { code } if code & 0xff == 0 => GENERIC_FAILURE_STATUS,
            Outcome::Failure { code } => code,
        }
    }
}

/// The capability every execution backend provides.
///
/// Exactly one engine is linked into a harness binary, so callers are
/// generic over it rather than boxing it.
pub trait Engine {
    /// Clears whatever global state the previous execution left behind.
    fn reset_global_state(&mut self);

    /// Runs `source` to completion.
    fn execute(&mut self, source: &[u8]) -> Outcome;
}

/// Adapts a closure into an [`Engine`] with no global state.
pub struct FnEngine<F>
where
    F: FnMut(&[u8]) -> Outcome,
{
    execute_fn: F,
}

impl<F> FnEngine<F>
where
    F: FnMut(&[u8]) -> Outcome,
{
    pub fn new(execute_fn: F) -> Self {
        Self { execute_fn }
    }
}

impl<F> Engine for FnEngine<F>
where
    F: FnMut(&[u8]) -> Outcome,
{
    fn reset_global_state(&mut self) {}

    fn execute(&mut self, source: &[u8]) -> Outcome {
        (self.execute_fn)(source)
    }
}

pub enum InputDelivery {
    StdIn,
    /// `{}` in the template is replaced by the path of a temporary file.
    File(String),
}

impl From<ConfigInputDelivery> for InputDelivery {
    fn from(delivery: ConfigInputDelivery) -> Self {
        match delivery {
            ConfigInputDelivery::StdIn => InputDelivery::StdIn,
            ConfigInputDelivery::File { template } => InputDelivery::File(template),
        }
    }
}

pub struct CommandEngineConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

impl From<CommandEngineSettings> for CommandEngineConfig {
    fn from(settings: CommandEngineSettings) -> Self {
        Self {
            command: settings.command,
            input_delivery: settings.input_delivery.into(),
            timeout: Duration::from_millis(settings.timeout_ms),
            working_dir: settings.working_dir,
        }
    }
}

/// Runs an external interpreter once per program.
///
/// Each execution is a fresh process, so there is no global state to reset.
/// Coverage only flows back if the interpreter is itself instrumented and
/// picks up `SHM_ID` from the inherited environment.
pub struct CommandEngine {
    config: CommandEngineConfig,
}

/// Exit code reported for a run killed by its timeout.
pub const TIMEOUT_CODE: i32 = 0x7e;
/// Exit code reported when the interpreter could not be started or fed.
pub const SPAWN_FAILURE_CODE: i32 = 0x7f;

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config }
    }

    fn wait_with_timeout(mut child: Child, timeout: Duration) -> Result<ExitStatus, Outcome> {
        let start_time = Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        tracing::warn!(?timeout, "engine command timed out, killing");
                        if let Err(e) = child.kill() {
                            tracing::error!("failed to kill timed-out engine command: {e}");
                        }
                        let _ = child.wait();
                        return Err(Outcome::Failure { code: TIMEOUT_CODE });
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    tracing::error!("error waiting for engine command: {e}");
                    return Err(Outcome::Failure {
                        code: SPAWN_FAILURE_CODE,
                    });
                }
            }
        }
    }

    fn outcome_of(status: ExitStatus) -> Outcome {
        if status.success() {
            return Outcome::Success;
        }
        if let Some(code) = status.code() {
            return Outcome::Failure { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Outcome::Failure { code: 128 + signal };
            }
        }
        Outcome::Failure {
            code: GENERIC_FAILURE_STATUS,
        }
    }
}

impl Engine for CommandEngine {
    fn reset_global_state(&mut self) {}

    fn execute(&mut self, source: &[u8]) -> Outcome {
        let Some((program, args)) = self.config.command.split_first() else {
            tracing::error!("engine command is empty");
            return Outcome::Failure {
                code: SPAWN_FAILURE_CODE,
            };
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        // Kept alive until the child has exited.
        let mut temp_file_handle: Option<tempfile::NamedTempFile> = None;

        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(arg_template) => {
                let mut named_temp_file = match tempfile::NamedTempFile::new() {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::error!("failed to create temp file: {e}");
                        return Outcome::Failure {
                            code: SPAWN_FAILURE_CODE,
                        };
                    }
                };
                if let Err(e) = named_temp_file
                    .write_all(source)
                    .and_then(|_| named_temp_file.flush())
                {
                    tracing::error!(
                        "failed to write program to {:?}: {e}",
                        named_temp_file.path()
                    );
                    return Outcome::Failure {
                        code: SPAWN_FAILURE_CODE,
                    };
                }

                let Some(path_str) = named_temp_file.path().to_str() else {
                    tracing::error!("temp file path is not valid UTF-8");
                    return Outcome::Failure {
                        code: SPAWN_FAILURE_CODE,
                    };
                };
                let final_arg = arg_template.replace("{}", path_str);
                for part in final_arg.split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                temp_file_handle = Some(named_temp_file);
            }
        }

        // Output goes straight to ours so the fuzzer's log capture sees it.
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("failed to spawn engine command {:?}: {e}", self.config.command);
                return Outcome::Failure {
                    code: SPAWN_FAILURE_CODE,
                };
            }
        };

        if let InputDelivery::StdIn = self.config.input_delivery {
            // Dropping the handle closes the pipe so the interpreter sees EOF.
            if let Some(mut child_stdin) = child.stdin.take() {
                // An interpreter may legitimately exit before reading everything.
                let written = match child_stdin.write_all(source) {
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                };
                if let Err(e) = written {
                    tracing::error!("error writing program to engine stdin: {e}, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Outcome::Failure {
                        code: SPAWN_FAILURE_CODE,
                    };
                }
            }
        }

        let outcome = match Self::wait_with_timeout(child, self.config.timeout) {
            Ok(status) => Self::outcome_of(status),
            Err(outcome) => outcome,
        };

        drop(temp_file_handle);
        outcome
    }
}
