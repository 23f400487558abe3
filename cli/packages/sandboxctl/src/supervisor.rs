//! Starts, tracks and stops the sandbox server process.
//!
//! Independent invocations coordinate only through the runtime record: a
//! detached start stores the server's pid, a foreground start stores our own
//! pid so that `sandbox stop` from another terminal signals us and we shut
//! the server down on the way out.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use sandboxctl_distro_management::distros::DistroManager;
use tokio::sync::mpsc;

use crate::cli::{write_stderr_line, write_stdout_line, CliError};
use crate::paths::Paths;
use crate::ports::{sandbox_ports, unavailable_ports, PortProbe, DEFAULT_HTTP_PORT};
use crate::process::{terminate_process, Termination};
use crate::prompt::Prompter;
use crate::runtime::{RuntimeRecord, RuntimeStateStore};
use crate::sandbox::Sandbox;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// How much sooner a foreground invocation gives up on its server than
/// `sandbox stop` gives up on the foreground invocation.
pub const FOREGROUND_STOP_MARGIN: Duration = Duration::from_secs(2);
/// JDWP port opened by `--debug`.
pub const DEBUG_PORT: u16 = 5005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    pub detach: bool,
    pub dev: bool,
    pub debug: bool,
    pub http_port: u16,
    pub force: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            detach: false,
            dev: false,
            debug: false,
            http_port: DEFAULT_HTTP_PORT,
            force: false,
        }
    }
}

/// Makes a distribution available locally and returns its directory.
pub trait DistroProvider {
    fn ensure_distro_exists(&self, distro: &str) -> Result<PathBuf, CliError>;
}

impl DistroProvider for DistroManager {
    fn ensure_distro_exists(&self, distro: &str) -> Result<PathBuf, CliError> {
        Ok(DistroManager::ensure_distro_exists(self, distro)?)
    }
}

/// Builds the command that runs a sandbox's server.
pub trait Launcher {
    fn command(&self, sandbox: &Sandbox, distro_dir: &Path, options: &StartOptions) -> Command;
}

/// Runs the distribution's own start script with the sandbox as its home.
#[derive(Debug, Clone)]
pub struct DistroLauncher {
    paths: Paths,
}

impl DistroLauncher {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }
}

impl Launcher for DistroLauncher {
    fn command(&self, sandbox: &Sandbox, distro_dir: &Path, options: &StartOptions) -> Command {
        let script = if cfg!(windows) { "server.bat" } else { "server.sh" };
        let mut command = Command::new(distro_dir.join("bin").join(script));
        command
            .current_dir(distro_dir)
            .env("XP_HOME", self.paths.sandbox_home(&sandbox.name));
        if options.dev {
            command.arg("dev");
        }
        if options.debug {
            command.env(
                "XP_OPTS",
                format!("-agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address={DEBUG_PORT}"),
            );
        }
        command
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    Detached {
        name: String,
        pid: u32,
        log_path: PathBuf,
    },
    Exited {
        name: String,
        status: ExitStatus,
    },
    Interrupted {
        name: String,
    },
}

impl fmt::Display for StartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOutcome::Detached { name, .. } => {
                write!(f, "Started sandbox '{name}' in detached mode.")
            }
            StartOutcome::Exited { name, status } => {
                write!(f, "Sandbox '{name}' exited ({status})")
            }
            StartOutcome::Interrupted { name } => write!(f, "Sandbox '{name}' stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub name: String,
    pub pid: u32,
    pub termination: Termination,
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sandbox '{}' stopped", self.name)
    }
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Interrupted,
}

pub struct Supervisor<'a> {
    paths: &'a Paths,
    store: &'a RuntimeStateStore,
    ports: &'a dyn PortProbe,
    distros: &'a dyn DistroProvider,
    launcher: &'a dyn Launcher,
    prompter: &'a dyn Prompter,
    grace_period: Duration,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        paths: &'a Paths,
        store: &'a RuntimeStateStore,
        ports: &'a dyn PortProbe,
        distros: &'a dyn DistroProvider,
        launcher: &'a dyn Launcher,
        prompter: &'a dyn Prompter,
    ) -> Self {
        Self {
            paths,
            store,
            ports,
            distros,
            launcher,
            prompter,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Grace period a foreground invocation grants its own server. Shorter
    /// than the one `stop` grants the invocation, so the server is gone
    /// before the invocation can be killed.
    pub fn child_grace_period(&self) -> Duration {
        self.grace_period.saturating_sub(FOREGROUND_STOP_MARGIN)
    }

    /// The verified running sandbox, if any.
    pub fn status(&self) -> Option<RuntimeRecord> {
        let mut record = self.store.read();
        if self.store.verify_liveness(&mut record) {
            Some(record)
        } else {
            None
        }
    }

    pub fn start(
        &self,
        sandbox: &Sandbox,
        options: &StartOptions,
    ) -> Result<StartOutcome, CliError> {
        let distro_dir = self.prepare(sandbox, options)?;
        let command = self.launcher.command(sandbox, &distro_dir, options);
        if options.detach {
            return self.start_detached(sandbox, command);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let (tx, rx) = mpsc::channel(2);
            listen_for_interrupt(tx);
            self.run_foreground(sandbox, command, rx).await
        })
    }

    /// Everything that has to hold before a server process may be spawned:
    /// no conflicting sandbox, free ports and an unpacked distribution.
    pub fn prepare(&self, sandbox: &Sandbox, options: &StartOptions) -> Result<PathBuf, CliError> {
        let mut record = self.store.read();
        if self.store.verify_liveness(&mut record) {
            if record.running == sandbox.name {
                return Err(CliError::AlreadyRunning(record.running));
            }
            self.ask_to_stop(&record, options.force)?;
        } else {
            let busy = unavailable_ports(self.ports, &sandbox_ports(options.http_port));
            if !busy.is_empty() {
                return Err(CliError::PortsUnavailable(busy));
            }
        }

        self.distros.ensure_distro_exists(&sandbox.distro)
    }

    fn ask_to_stop(&self, record: &RuntimeRecord, force: bool) -> Result<(), CliError> {
        let message = format!(
            "Sandbox '{}' is running, do you want to stop it?",
            record.running
        );
        if !force && !self.prompter.confirm(&message, true)? {
            return Err(CliError::Aborted(format!(
                "Sandbox '{}' is still running",
                record.running
            )));
        }
        let outcome = self.stop(record)?;
        write_stdout_line(&outcome.to_string())
    }

    pub fn start_detached(
        &self,
        sandbox: &Sandbox,
        mut command: Command,
    ) -> Result<StartOutcome, CliError> {
        let log_path = self.paths.sandbox_log_path(&sandbox.name);
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log_file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let log_file_err = log_file.try_clone()?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));
        detach(&mut command);

        let mut child = command.spawn()?;
        let pid = child.id();
        if let Err(err) = self.store.set_running(&sandbox.name, pid) {
            tracing::error!(sandbox = %sandbox.name, pid, error = %err, "failed to record detached sandbox, killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }
        tracing::info!(sandbox = %sandbox.name, pid, log = %log_path.display(), "started detached sandbox");
        Ok(StartOutcome::Detached {
            name: sandbox.name.clone(),
            pid,
            log_path,
        })
    }

    /// Runs the server as our child until it exits or the first interrupt
    /// arrives. The first interrupt stops the server within the child grace
    /// period; a second one kills it right away. Either way the runtime
    /// record is cleared if it still names us.
    pub async fn run_foreground(
        &self,
        sandbox: &Sandbox,
        command: Command,
        mut interrupts: mpsc::Receiver<()>,
    ) -> Result<StartOutcome, CliError> {
        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);
        let mut child = command.spawn()?;
        let own_pid = std::process::id();
        self.store.set_running(&sandbox.name, own_pid)?;
        tracing::info!(sandbox = %sandbox.name, child = ?child.id(), "started sandbox in foreground");

        // A closed channel disables the interrupt branch instead of firing it.
        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            Some(()) = interrupts.recv() => Wake::Interrupted,
        };

        match wake {
            Wake::Exited(status) => {
                self.store.clear_running_if(own_pid)?;
                Ok(StartOutcome::Exited {
                    name: sandbox.name.clone(),
                    status: status?,
                })
            }
            Wake::Interrupted => {
                write_stderr_line(&format!(
                    "\nGot interrupt signal, stopping sandbox '{}'\n",
                    sandbox.name
                ))?;
                if let Some(pid) = child.id() {
                    let grace = self.child_grace_period();
                    let terminate =
                        tokio::task::spawn_blocking(move || terminate_process(pid, grace));
                    tokio::select! {
                        joined = terminate => match joined {
                            Ok(termination) => {
                                let termination = termination?;
                                tracing::debug!(pid, ?termination, "sandbox child terminated");
                            }
                            Err(err) => tracing::warn!(pid, error = %err, "terminate task failed"),
                        },
                        Some(()) = interrupts.recv() => {
                            write_stderr_line(&format!(
                                "Got second interrupt signal, killing sandbox '{}'",
                                sandbox.name
                            ))?;
                            if let Err(err) = child.start_kill() {
                                tracing::warn!(pid, error = %err, "failed to kill sandbox child");
                            }
                        }
                    }
                }
                let _ = child.wait().await;
                self.store.clear_running_if(own_pid)?;
                Ok(StartOutcome::Interrupted {
                    name: sandbox.name.clone(),
                })
            }
        }
    }

    /// Stops the verified running sandbox.
    pub fn stop_running(&self) -> Result<StopOutcome, CliError> {
        let mut record = self.store.read();
        if !self.store.verify_liveness(&mut record) {
            return Err(CliError::NothingRunning);
        }
        self.stop(&record)
    }

    pub fn stop(&self, record: &RuntimeRecord) -> Result<StopOutcome, CliError> {
        let termination = terminate_process(record.pid, self.grace_period)?;
        self.store.clear_running_if(record.pid)?;
        tracing::info!(sandbox = %record.running, pid = record.pid, ?termination, "stopped sandbox");
        Ok(StopOutcome {
            name: record.running.clone(),
            pid: record.pid,
            termination,
        })
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

/// Sends on `tx` for every Ctrl-C, or SIGTERM on unix, until the receiver
/// is gone. Must be called inside a tokio runtime.
pub fn listen_for_interrupt(tx: mpsc::Sender<()>) {
    tokio::spawn(async move {
        loop {
            wait_for_signal().await;
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to listen for SIGTERM");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::net::TcpListener;

    use super::*;
    use crate::ports::{LocalPortProbe, INFO_PORT, MGMT_PORT};
    use crate::process::is_process_running;
    use crate::prompt::testing::ScriptedPrompter;

    struct FreePorts;

    impl PortProbe for FreePorts {
        fn is_available(&self, _port: u16) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct FakeDistros {
        requested: RefCell<Vec<String>>,
    }

    impl DistroProvider for FakeDistros {
        fn ensure_distro_exists(&self, distro: &str) -> Result<PathBuf, CliError> {
            self.requested.borrow_mut().push(distro.to_string());
            Ok(std::env::temp_dir())
        }
    }

    /// Launches an arbitrary program in place of a server.
    struct FakeLauncher {
        program: String,
        args: Vec<String>,
        built: Cell<u32>,
    }

    impl FakeLauncher {
        fn new(program: &str, args: &[&str]) -> Self {
            Self {
                program: program.to_string(),
                args: args.iter().map(|arg| arg.to_string()).collect(),
                built: Cell::new(0),
            }
        }
    }

    impl Launcher for FakeLauncher {
        fn command(&self, _sandbox: &Sandbox, _distro_dir: &Path, _options: &StartOptions) -> Command {
            self.built.set(self.built.get() + 1);
            let mut command = Command::new(&self.program);
            command.args(&self.args);
            command
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: Paths,
        store: RuntimeStateStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("create tempdir");
        let paths = Paths::new(dir.path());
        let store = RuntimeStateStore::new(paths.runtime_file());
        Fixture {
            _dir: dir,
            paths,
            store,
        }
    }

    fn sandbox(name: &str) -> Sandbox {
        Sandbox {
            name: name.to_string(),
            distro: "7.14.0".to_string(),
        }
    }

    fn sleeper() -> std::process::Child {
        Command::new("sleep").arg("30").spawn().expect("spawn sleep")
    }

    #[test]
    fn occupied_ports_prevent_start() {
        let fx = fixture();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::default();
        let supervisor = Supervisor::new(
            &fx.paths,
            &fx.store,
            &LocalPortProbe,
            &distros,
            &launcher,
            &prompter,
        );

        let options = StartOptions {
            detach: true,
            http_port: port,
            ..StartOptions::default()
        };
        let err = supervisor
            .start(&sandbox("dev"), &options)
            .expect_err("port is taken");
        let CliError::PortsUnavailable(ports) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(ports.contains(&port));
        assert_eq!(launcher.built.get(), 0);
        assert!(distros.requested.borrow().is_empty());
        assert_eq!(fx.store.read(), RuntimeRecord::default());
    }

    /// Reports a fixed set of ports as taken.
    struct BusyPorts(Vec<u16>);

    impl PortProbe for BusyPorts {
        fn is_available(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    #[test]
    fn busy_management_ports_prevent_start() {
        let fx = fixture();
        fx.store.set_session("keep").expect("seed session");
        let before = fx.store.read();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::default();

        for busy in [vec![MGMT_PORT], vec![INFO_PORT], vec![MGMT_PORT, INFO_PORT]] {
            let probe = BusyPorts(busy.clone());
            let supervisor =
                Supervisor::new(&fx.paths, &fx.store, &probe, &distros, &launcher, &prompter);
            let err = supervisor
                .start(&sandbox("dev"), &StartOptions::default())
                .expect_err("ports are taken");
            let CliError::PortsUnavailable(ports) = err else {
                panic!("unexpected error: {err}");
            };
            assert_eq!(ports, busy);
        }
        assert_eq!(launcher.built.get(), 0);
        assert!(distros.requested.borrow().is_empty());
        assert_eq!(fx.store.read(), before);
    }

    #[test]
    fn already_running_sandbox_is_left_alone() {
        let fx = fixture();
        fx.store
            .set_running("dev", std::process::id())
            .expect("seed record");
        let before = fx.store.read();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter);

        let err = supervisor
            .start(&sandbox("dev"), &StartOptions::default())
            .expect_err("already running");
        assert!(matches!(err, CliError::AlreadyRunning(ref name) if name == "dev"));
        assert_eq!(fx.store.read(), before);
        assert_eq!(launcher.built.get(), 0);
        assert!(prompter.asked().is_empty());
    }

    #[test]
    fn stop_without_running_sandbox_fails() {
        let fx = fixture();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter);

        assert!(matches!(
            supervisor.stop_running(),
            Err(CliError::NothingRunning)
        ));
        assert!(supervisor.status().is_none());
    }

    #[test]
    fn detached_start_and_stop_round_trip() {
        let fx = fixture();
        fx.store.set_session("keep").expect("seed session");
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter)
                .with_grace_period(Duration::from_secs(2));

        let options = StartOptions {
            detach: true,
            http_port: 8080,
            ..StartOptions::default()
        };
        let outcome = supervisor
            .start(&sandbox("dev-sandbox"), &options)
            .expect("start");
        assert_eq!(
            outcome.to_string(),
            "Started sandbox 'dev-sandbox' in detached mode."
        );
        let StartOutcome::Detached { pid, log_path, .. } = outcome else {
            panic!("expected detached start");
        };
        assert!(log_path.exists());
        assert_eq!(distros.requested.borrow().as_slice(), ["7.14.0".to_string()]);

        let record = supervisor.status().expect("sandbox is running");
        assert_eq!(record.running, "dev-sandbox");
        assert_eq!(record.pid, pid);
        assert_eq!(record.session_id, "keep");

        let stopped = supervisor.stop_running().expect("stop");
        assert_eq!(stopped.to_string(), "Sandbox 'dev-sandbox' stopped");
        assert_eq!(stopped.pid, pid);
        let record = fx.store.read();
        assert!(record.running.is_empty());
        assert_eq!(record.pid, 0);
        assert_eq!(record.session_id, "keep");
        if cfg!(target_os = "linux") {
            assert!(!is_process_running(pid));
        }
    }

    #[test]
    fn detached_child_is_killed_when_it_cannot_be_recorded() {
        let fx = fixture();
        let blocker = fx.paths.home().join("not-a-dir");
        fs::write(&blocker, "").expect("create blocking file");
        let store = RuntimeStateStore::new(blocker.join("runtime.toml"));
        let pid_file = fx.paths.home().join("child.pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sh", &["-c", &script]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &store, &FreePorts, &distros, &launcher, &prompter);

        let options = StartOptions {
            detach: true,
            ..StartOptions::default()
        };
        let err = supervisor
            .start(&sandbox("dev"), &options)
            .expect_err("record can not be written");
        assert!(matches!(err, CliError::Io(_)), "{err}");
        assert_eq!(launcher.built.get(), 1);
        if let Some(pid) = fs::read_to_string(&pid_file)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())
        {
            assert!(!is_process_running(pid));
        }
    }

    #[test]
    fn starting_another_sandbox_stops_the_running_one_after_confirmation() {
        let fx = fixture();
        let mut other = sleeper();
        fx.store.set_running("other", other.id()).expect("seed record");
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::with_confirms(&[true]);
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter)
                .with_grace_period(Duration::from_secs(2));

        let options = StartOptions {
            detach: true,
            ..StartOptions::default()
        };
        let outcome = supervisor.start(&sandbox("dev"), &options).expect("start");
        assert_eq!(
            prompter.asked(),
            vec!["Sandbox 'other' is running, do you want to stop it?".to_string()]
        );
        assert!(!other.wait().expect("reap other").success());

        let StartOutcome::Detached { pid, .. } = outcome else {
            panic!("expected detached start");
        };
        assert_eq!(fx.store.read().running, "dev");
        supervisor.stop_running().expect("cleanup");
        if cfg!(target_os = "linux") {
            assert!(!is_process_running(pid));
        }
    }

    #[test]
    fn declining_to_stop_aborts_the_start() {
        let fx = fixture();
        let mut other = sleeper();
        fx.store.set_running("other", other.id()).expect("seed record");
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::with_confirms(&[false]);
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter);

        let err = supervisor
            .start(&sandbox("dev"), &StartOptions::default())
            .expect_err("declined");
        assert!(matches!(err, CliError::Aborted(_)));
        assert!(is_process_running(other.id()));
        assert_eq!(fx.store.read().running, "other");
        assert_eq!(launcher.built.get(), 0);

        other.kill().expect("kill other");
        other.wait().expect("reap other");
    }

    #[tokio::test]
    async fn foreground_interrupt_stops_child_and_clears_record() {
        let fx = fixture();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("sleep", &["30"]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter)
                .with_grace_period(Duration::from_secs(2));

        let mut command = Command::new("sleep");
        command.arg("30");
        let (tx, rx) = mpsc::channel(2);
        tx.try_send(()).expect("send interrupt");
        let dev = sandbox("dev");
        let outcome = supervisor
            .run_foreground(&dev, command, rx)
            .await
            .expect("run");
        assert!(matches!(outcome, StartOutcome::Interrupted { ref name } if name == "dev"));
        assert_eq!(fx.store.read(), RuntimeRecord::default());
    }

    #[tokio::test]
    async fn foreground_exit_clears_record() {
        let fx = fixture();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("true", &[]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter);

        let (_tx, rx) = mpsc::channel(2);
        let dev = sandbox("dev");
        let outcome = supervisor
            .run_foreground(&dev, Command::new("true"), rx)
            .await
            .expect("run");
        let StartOutcome::Exited { status, .. } = outcome else {
            panic!("expected natural exit");
        };
        assert!(status.success());
        assert_eq!(fx.store.read(), RuntimeRecord::default());
    }

    #[tokio::test]
    async fn foreground_leaves_a_newer_record_alone() {
        let fx = fixture();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("true", &[]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter);

        let mut command = Command::new("sh");
        command.args(["-c", "sleep 0.2"]);
        let (_tx, rx) = mpsc::channel(2);
        let dev = sandbox("dev");
        let run = supervisor.run_foreground(&dev, command, rx);
        let store = fx.store.clone();
        let takeover = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.set_running("qa", 1).expect("newer record");
        };
        let (outcome, ()) = tokio::join!(run, takeover);
        assert!(matches!(outcome.expect("run"), StartOutcome::Exited { .. }));
        let record = fx.store.read();
        assert_eq!(record.running, "qa");
        assert_eq!(record.pid, 1);
    }

    #[tokio::test]
    async fn second_interrupt_kills_a_stubborn_child() {
        let fx = fixture();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("true", &[]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter)
                .with_grace_period(Duration::from_secs(30));

        let mut command = Command::new("sh");
        command.args(["-c", "trap '' TERM; exec sleep 30"]);
        let (tx, rx) = mpsc::channel(2);
        tx.try_send(()).expect("first interrupt");
        tx.try_send(()).expect("second interrupt");
        let dev = sandbox("dev");
        let started = std::time::Instant::now();
        let outcome = supervisor
            .run_foreground(&dev, command, rx)
            .await
            .expect("run");
        assert!(matches!(outcome, StartOutcome::Interrupted { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(fx.store.read(), RuntimeRecord::default());
    }

    #[test]
    fn foreground_child_gets_less_grace_than_stop() {
        let fx = fixture();
        let distros = FakeDistros::default();
        let launcher = FakeLauncher::new("true", &[]);
        let prompter = ScriptedPrompter::default();
        let supervisor =
            Supervisor::new(&fx.paths, &fx.store, &FreePorts, &distros, &launcher, &prompter);

        // Child grace plus the final kill wait must end before `stop` escalates.
        assert!(supervisor.child_grace_period() + Duration::from_secs(1) < DEFAULT_GRACE_PERIOD);
    }

    #[test]
    fn distro_launcher_builds_the_server_command() {
        let paths = Paths::new("/home/user/.sandboxctl");
        let launcher = DistroLauncher::new(paths.clone());
        let options = StartOptions {
            dev: true,
            debug: true,
            ..StartOptions::default()
        };
        let distro_dir = Path::new("/opt/distros/enonic-xp-linux-sdk-7.14.0");
        let command = launcher.command(&sandbox("dev"), distro_dir, &options);

        assert_eq!(
            Path::new(command.get_program()),
            distro_dir.join("bin").join("server.sh")
        );
        let args: Vec<_> = command.get_args().collect();
        assert_eq!(args, ["dev"]);
        assert_eq!(command.get_current_dir(), Some(distro_dir));
        let envs: Vec<_> = command.get_envs().collect();
        assert!(envs.iter().any(|(key, value)| {
            *key == "XP_HOME" && value.map(Path::new) == Some(paths.sandbox_home("dev").as_path())
        }));
        assert!(envs.iter().any(|(key, value)| {
            *key == "XP_OPTS"
                && value
                    .and_then(|value| value.to_str())
                    .is_some_and(|value| value.contains("address=5005"))
        }));
    }
}
