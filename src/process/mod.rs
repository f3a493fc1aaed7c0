//! Supervision of the external database process
//!
//! A [`Process`] owns exactly one child: the database daemon this pilot
//! sidecar manages. Start is a non-blocking spawn; stop, terminate and
//! reload deliver a configured signal and then block until the child has
//! fully exited. Calling any signal operation before start is a contract
//! violation and returns an error.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::Error;

/// Description of the command used to launch the database process.
///
/// Built by the database-specific strategy; the supervisor never decides
/// what to run, only how to run it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Program to execute
    pub program: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Extra environment variables (inherits the pilot's environment)
    pub env: Vec<(String, String)>,
    /// Working directory, if different from the pilot's
    pub working_dir: Option<std::path::PathBuf>,
}

impl CommandDescriptor {
    /// Create a descriptor for the given program with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Append an argument and return self for chaining
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append an environment variable and return self for chaining
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Signals delivered for each supervisor operation.
///
/// Defaults follow common daemon conventions: SIGTERM for graceful stop,
/// SIGKILL for terminate, SIGHUP for reload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalMap {
    /// Signal sent by [`Process::stop`]
    pub stop: Signal,
    /// Signal sent by [`Process::terminate`]
    pub terminate: Signal,
    /// Signal sent by [`Process::reload`]
    pub reload: Signal,
}

impl Default for SignalMap {
    fn default() -> Self {
        Self {
            stop: Signal::SIGTERM,
            terminate: Signal::SIGKILL,
            reload: Signal::SIGHUP,
        }
    }
}

/// Lifecycle state of the supervised process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Never started
    New,
    /// Started and no exit recorded yet
    Running,
    /// Exited with the given status code (None when killed by signal)
    Exited(Option<i32>),
}

/// Supervisor for a single external database process
pub struct Process {
    descriptor: CommandDescriptor,
    signals: SignalMap,
    child: Option<Child>,
    state: ProcessState,
}

impl Process {
    /// Create a supervisor for the given command. Nothing is spawned yet.
    pub fn new(descriptor: CommandDescriptor, signals: SignalMap) -> Self {
        Self {
            descriptor,
            signals,
            child: None,
            state: ProcessState::New,
        }
    }

    /// Spawn the external process. Non-blocking: returns as soon as the
    /// spawn itself succeeds or fails.
    ///
    /// Start must not be called twice without an intervening completed
    /// stop or terminate.
    pub fn start(&mut self) -> crate::Result<()> {
        if self.child.is_some() {
            return Err(Error::process(format!(
                "process {:?} already started",
                self.descriptor.program
            )));
        }

        let mut command = Command::new(&self.descriptor.program);
        command.args(&self.descriptor.args);
        for (key, value) in &self.descriptor.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.descriptor.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            Error::process(format!(
                "failed to spawn {:?}: {e}",
                self.descriptor.program
            ))
        })?;

        info!(
            program = %self.descriptor.program,
            pid = child.id(),
            "Process started"
        );
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Send the stop signal and block until the process exits
    pub async fn stop(&mut self) -> crate::Result<()> {
        self.signal_and_wait(self.signals.stop).await
    }

    /// Send the terminate signal and block until the process exits
    pub async fn terminate(&mut self) -> crate::Result<()> {
        self.signal_and_wait(self.signals.terminate).await
    }

    /// Send the reload signal and block until the process exits
    pub async fn reload(&mut self) -> crate::Result<()> {
        self.signal_and_wait(self.signals.reload).await
    }

    /// True once started and no exit has been recorded yet
    pub fn running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(code = ?status.code(), "Process exit recorded");
                self.state = ProcessState::Exited(status.code());
                // The child is reaped; a later start() spawns a fresh one.
                self.child = None;
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    async fn signal_and_wait(&mut self, signal: Signal) -> crate::Result<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| Error::process("process has not been started"))?;

        // A None pid means the child already exited and was reaped; the
        // wait below then returns immediately.
        if let Some(pid) = child.id() {
            kill(Pid::from_raw(pid as i32), signal)
                .map_err(|e| Error::process(format!("failed to signal pid {pid}: {e}")))?;
            debug!(pid, signal = %signal, "Signal sent");
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::process(format!("failed to wait for process exit: {e}")))?;
        info!(code = ?status.code(), "Process exited");
        self.state = ProcessState::Exited(status.code());
        self.child = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_descriptor() -> CommandDescriptor {
        CommandDescriptor::new("sleep").arg("30")
    }

    #[tokio::test]
    async fn stop_before_start_is_a_contract_error() {
        let mut process = Process::new(sleep_descriptor(), SignalMap::default());
        let err = process.stop().await.unwrap_err();
        assert!(err.to_string().contains("has not been started"));
        assert_eq!(process.state(), ProcessState::New);
    }

    #[tokio::test]
    async fn start_spawns_and_stop_waits_for_exit() {
        let mut process = Process::new(sleep_descriptor(), SignalMap::default());
        process.start().unwrap();
        assert!(process.running());
        assert_eq!(process.state(), ProcessState::Running);

        process.stop().await.unwrap();
        assert!(!process.running());
        assert!(matches!(process.state(), ProcessState::Exited(_)));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mut process = Process::new(sleep_descriptor(), SignalMap::default());
        process.start().unwrap();
        let err = process.start().unwrap_err();
        assert!(err.to_string().contains("already started"));
        process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn start_after_completed_stop_is_allowed() {
        let mut process = Process::new(sleep_descriptor(), SignalMap::default());
        process.start().unwrap();
        process.stop().await.unwrap();
        process.start().unwrap();
        process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let descriptor = CommandDescriptor::new("/nonexistent/database-daemon");
        let mut process = Process::new(descriptor, SignalMap::default());
        let err = process.start().unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
        assert!(!process.running());
    }

    #[tokio::test]
    async fn running_observes_natural_exit() {
        let descriptor = CommandDescriptor::new("true");
        let mut process = Process::new(descriptor, SignalMap::default());
        process.start().unwrap();
        // Give the process a moment to exit on its own.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!process.running());
        assert_eq!(process.state(), ProcessState::Exited(Some(0)));
    }

    #[tokio::test]
    async fn start_after_natural_exit_is_allowed() {
        let descriptor = CommandDescriptor::new("true");
        let mut process = Process::new(descriptor, SignalMap::default());
        process.start().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!process.running());

        // A crashed or exited daemon must be restartable.
        process.start().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!process.running());
        assert_eq!(process.state(), ProcessState::Exited(Some(0)));
    }

    #[test]
    fn descriptor_builder_chains() {
        let descriptor = CommandDescriptor::new("cassandra")
            .arg("-f")
            .env("CASSANDRA_CONF", "/etc/cassandra");
        assert_eq!(descriptor.program, "cassandra");
        assert_eq!(descriptor.args, vec!["-f"]);
        assert_eq!(
            descriptor.env,
            vec![("CASSANDRA_CONF".to_string(), "/etc/cassandra".to_string())]
        );
    }
}
