use std::io::Write;

use clap::{Args, Parser, Subcommand};

// Include the generated version constant
mod build_version {
    include!(concat!(env!("OUT_DIR"), "/version.rs"));
}
use reqwest::Method;
use sandboxctl_distro_management::distros::{DistroError, DistroManager};
use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::paths::Paths;
use crate::ports::{LocalPortProbe, DEFAULT_HTTP_PORT};
use crate::project::{read_project_data, write_project_data, ProjectData};
use crate::prompt::{Prompter, TerminalPrompter};
use crate::remote::RemoteStore;
use crate::runtime::RuntimeStateStore;
use crate::sandbox::{Sandbox, SandboxRegistry};
use crate::session::{parse_response, SessionClient};
use crate::supervisor::{DistroLauncher, StartOptions, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "sandboxctl", bin_name = "sandboxctl")]
#[command(about = "Manage local server sandboxes", version = build_version::VERSION)]
#[command(arg_required_else_help = true)]
pub struct SandboxCtlCli {
    #[command(subcommand)]
    command: Command,

    /// Authentication token for basic authentication (<user>:<password>).
    #[arg(long, short = 'a', global = true)]
    auth: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, start and stop local sandboxes.
    Sandbox(SandboxArgs),
    /// Project level settings.
    Project(ProjectArgs),
    /// Manage the remotes API calls are sent to.
    Remote(RemoteArgs),
    /// Call the management API of the active remote.
    Api(ApiArgs),
}

#[derive(Args, Debug)]
pub struct SandboxArgs {
    #[command(subcommand)]
    command: SandboxCommand,
}

#[derive(Subcommand, Debug)]
pub enum SandboxCommand {
    /// Start the sandbox.
    Start(StartArgs),
    /// Stop the running sandbox.
    Stop,
    /// Show which sandbox is running.
    Status,
    /// List all sandboxes.
    #[command(alias = "ls")]
    List,
    /// Create a new sandbox.
    Create(CreateArgs),
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Sandbox to start; defaults to the project's sandbox.
    name: Option<String>,

    /// Run in the background even after the console is closed.
    #[arg(long, short = 'd')]
    detach: bool,

    /// Run the distribution in development mode.
    #[arg(long)]
    dev: bool,

    /// Run the server with debug enabled on port 5005.
    #[arg(long)]
    debug: bool,

    /// HTTP port to check for availability before starting.
    #[arg(long = "http.port", default_value_t = DEFAULT_HTTP_PORT)]
    http_port: u16,

    /// Accept all prompts with their default answer.
    #[arg(long, short = 'f')]
    force: bool,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    name: String,

    /// Server version the sandbox runs.
    #[arg(long)]
    version: String,
}

#[derive(Args, Debug)]
pub struct ProjectArgs {
    #[command(subcommand)]
    command: ProjectCommand,
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    /// Set the default sandbox associated with the current project.
    #[command(aliases = ["sbox", "sb"])]
    Sandbox(ProjectSandboxArgs),
}

#[derive(Args, Debug)]
pub struct ProjectSandboxArgs {
    name: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoteArgs {
    #[command(subcommand)]
    command: RemoteCommand,
}

#[derive(Subcommand, Debug)]
pub enum RemoteCommand {
    /// List remotes, marking the active one.
    #[command(alias = "ls")]
    List,
    /// Add a remote.
    Add(RemoteAddArgs),
    /// Remove a remote.
    #[command(alias = "rm")]
    Remove(RemoteNameArgs),
    /// Make a remote the active one.
    Use(RemoteNameArgs),
}

#[derive(Args, Debug)]
pub struct RemoteAddArgs {
    name: String,
    url: String,

    #[arg(long, short = 'u')]
    user: Option<String>,

    #[arg(long, short = 'p')]
    pass: Option<String>,
}

#[derive(Args, Debug)]
pub struct RemoteNameArgs {
    name: String,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// Send a GET request.
    Get(ApiRequestArgs),
    /// Send a POST request.
    Post(ApiPostArgs),
    /// Send a DELETE request.
    Delete(ApiRequestArgs),
}

#[derive(Args, Debug)]
pub struct ApiRequestArgs {
    /// Absolute URL, `/path` on the remote host, or a path under the remote's base path.
    path: String,

    /// Progress message shown while the request is in flight.
    #[arg(long, short = 'm')]
    message: Option<String>,
}

#[derive(Args, Debug)]
pub struct ApiPostArgs {
    #[command(flatten)]
    request: ApiRequestArgs,

    /// JSON request body.
    #[arg(long, short = 'D')]
    data: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Not a valid url: {0}")]
    InvalidUrl(String),
    #[error("Authentication token '{0}' must have the following format <user>:<password>")]
    InvalidAuthToken(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("Unable to connect to remote service: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Error parsing response: {0}")]
    ParseResponse(#[source] serde_json::Error),
    #[error("{status} {message}")]
    Api { status: u16, message: String },
    #[error("{0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("Sandbox '{0}' is already running")]
    AlreadyRunning(String),
    #[error("Port(s) {} are not available, stop the app(s) using them first!", format_ports(.0))]
    PortsUnavailable(Vec<u16>),
    #[error("No sandbox is currently running.")]
    NothingRunning,
    #[error("Sandbox '{0}' does not exist")]
    SandboxNotFound(String),
    #[error("{0}")]
    Aborted(String),
    #[error("prompt error: {0}")]
    Prompt(String),
    #[error(transparent)]
    Distro(#[from] DistroError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    TomlDe(#[from] toml_edit::de::Error),
    #[error("toml error: {0}")]
    TomlSer(#[from] toml_edit::ser::Error),
    #[error("toml error: {0}")]
    TomlEdit(#[from] toml_edit::TomlError),
}

fn format_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|port| port.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct CliConfig {
    pub auth: Option<String>,
    pub paths: Paths,
}

pub fn run_sandboxctl() -> Result<(), CliError> {
    let cli = SandboxCtlCli::parse();
    let SandboxCtlCli { command, auth } = cli;
    let config = CliConfig {
        auth,
        paths: Paths::from_env(),
    };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Config(err.to_string()))
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    let prompter = TerminalPrompter;
    match command {
        Command::Sandbox(args) => run_sandbox(&args.command, cli, &prompter),
        Command::Project(args) => run_project(&args.command, cli, &prompter),
        Command::Remote(args) => run_remote(&args.command, cli),
        Command::Api(args) => run_api(&args.command, cli, &prompter),
    }
}

fn run_sandbox(
    command: &SandboxCommand,
    cli: &CliConfig,
    prompter: &dyn Prompter,
) -> Result<(), CliError> {
    let store = RuntimeStateStore::new(cli.paths.runtime_file());
    let registry = SandboxRegistry::new(cli.paths.sandboxes_dir());
    let distros = DistroManager::new(cli.paths.distros_dir())?;
    let launcher = DistroLauncher::new(cli.paths.clone());
    let supervisor = Supervisor::new(
        &cli.paths,
        &store,
        &LocalPortProbe,
        &distros,
        &launcher,
        prompter,
    );

    match command {
        SandboxCommand::Start(args) => {
            let sandbox = resolve_sandbox(&registry, prompter, args.name.as_deref())?;
            let options = StartOptions {
                detach: args.detach,
                dev: args.dev,
                debug: args.debug,
                http_port: args.http_port,
                force: args.force,
            };
            let outcome = supervisor.start(&sandbox, &options)?;
            write_stdout_line(&outcome.to_string())
        }
        SandboxCommand::Stop => {
            let outcome = supervisor.stop_running()?;
            write_stdout_line(&outcome.to_string())
        }
        SandboxCommand::Status => match supervisor.status() {
            Some(record) => write_stdout_line(&format!(
                "Sandbox '{}' is running (PID {}).",
                record.running, record.pid
            )),
            None => write_stdout_line("No sandbox is currently running."),
        },
        SandboxCommand::List => {
            let running = supervisor.status().map(|record| record.running);
            let sandboxes = registry.list()?;
            if sandboxes.is_empty() {
                return write_stderr_line("No sandboxes found.");
            }
            for sandbox in sandboxes {
                let marker = if running.as_deref() == Some(sandbox.name.as_str()) {
                    "*"
                } else {
                    " "
                };
                write_stdout_line(&format!("{marker} {} ({})", sandbox.name, sandbox.distro))?;
            }
            Ok(())
        }
        SandboxCommand::Create(args) => {
            let sandbox = registry.create(&args.name, &args.version)?;
            write_stdout_line(&format!(
                "Sandbox '{}' created with distro '{}'.",
                sandbox.name, sandbox.distro
            ))
        }
    }
}

/// Explicit name, else the project binding in the working directory, else an
/// interactive choice.
fn resolve_sandbox(
    registry: &SandboxRegistry,
    prompter: &dyn Prompter,
    name: Option<&str>,
) -> Result<Sandbox, CliError> {
    if let Some(name) = name {
        return registry
            .load(name)?
            .ok_or_else(|| CliError::SandboxNotFound(name.to_string()));
    }

    let project_dir = std::env::current_dir()?;
    if let Some(project) = read_project_data(&project_dir)? {
        match registry.load(&project.sandbox)? {
            Some(sandbox) => return Ok(sandbox),
            None => tracing::warn!(
                sandbox = %project.sandbox,
                "project sandbox does not exist"
            ),
        }
    }

    registry.ensure_sandbox(
        prompter,
        "No sandboxes found, create one?",
        "Select sandbox to start:",
    )
}

fn run_project(
    command: &ProjectCommand,
    cli: &CliConfig,
    prompter: &dyn Prompter,
) -> Result<(), CliError> {
    match command {
        ProjectCommand::Sandbox(args) => {
            let registry = SandboxRegistry::new(cli.paths.sandboxes_dir());
            let sandbox = match args.name.as_deref() {
                Some(name) => registry
                    .load(name)?
                    .ok_or_else(|| CliError::SandboxNotFound(name.to_string()))?,
                None => registry.ensure_sandbox(
                    prompter,
                    "No sandboxes found, do you want to create one?",
                    "Select sandbox to use as default for this project:",
                )?,
            };
            let project_dir = std::env::current_dir()?;
            write_project_data(
                &project_dir,
                &ProjectData {
                    sandbox: sandbox.name.clone(),
                },
            )?;
            write_stdout_line(&format!("\nSandbox '{}' set as default.", sandbox.name))
        }
    }
}

fn run_remote(command: &RemoteCommand, cli: &CliConfig) -> Result<(), CliError> {
    let remotes = RemoteStore::new(cli.paths.remotes_file());
    match command {
        RemoteCommand::List => {
            let active = remotes.active_name()?;
            for remote in remotes.list()? {
                let marker = if remote.name == active { "*" } else { " " };
                let user = if remote.user.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", remote.user)
                };
                write_stdout_line(&format!("{marker} {} {}{user}", remote.name, remote.url))?;
            }
            Ok(())
        }
        RemoteCommand::Add(args) => {
            let remote = remotes.add(
                &args.name,
                &args.url,
                args.user.as_deref().unwrap_or_default(),
                args.pass.as_deref().unwrap_or_default(),
            )?;
            write_stdout_line(&format!("Remote '{}' added ({}).", remote.name, remote.url))
        }
        RemoteCommand::Remove(args) => {
            if remotes.remove(&args.name)? {
                clear_cached_session(cli)?;
            }
            write_stdout_line(&format!("Remote '{}' removed.", args.name))
        }
        RemoteCommand::Use(args) => {
            if remotes.set_active(&args.name)? {
                clear_cached_session(cli)?;
            }
            write_stdout_line(&format!("Remote '{}' is now active.", args.name))
        }
    }
}

/// A session cookie belongs to the remote that issued it.
fn clear_cached_session(cli: &CliConfig) -> Result<(), CliError> {
    let store = RuntimeStateStore::new(cli.paths.runtime_file());
    if store.clear_session()? {
        tracing::debug!("cleared cached session after switching remotes");
    }
    Ok(())
}

fn run_api(command: &ApiCommand, cli: &CliConfig, prompter: &dyn Prompter) -> Result<(), CliError> {
    let (method, request, data) = match command {
        ApiCommand::Get(args) => (Method::GET, args, None),
        ApiCommand::Post(args) => (Method::POST, &args.request, args.data.as_deref()),
        ApiCommand::Delete(args) => (Method::DELETE, args, None),
    };
    let body = match data {
        Some(data) => {
            // Reject malformed JSON before anything goes over the wire.
            let _: Value = serde_json::from_str(data)?;
            Some(data.as_bytes().to_vec())
        }
        None => None,
    };

    let store = RuntimeStateStore::new(cli.paths.runtime_file());
    let remote = RemoteStore::new(cli.paths.remotes_file()).active()?;
    let client = SessionClient::new(&store, remote, prompter, cli.auth.clone());
    let api_request = client.build_request(method, &request.path, body)?;
    let response = client.send(api_request, request.message.as_deref())?;
    let json: Value = parse_response(response)?;
    write_stdout_line(&serde_json::to_string_pretty(&json)?)
}

pub(crate) fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

pub(crate) fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    use clap::CommandFactory;
    use serial_test::serial;

    use super::*;
    use crate::prompt::testing::ScriptedPrompter;

    #[test]
    fn cli_definition_is_consistent() {
        SandboxCtlCli::command().debug_assert();
    }

    #[test]
    fn parses_start_flags() {
        let cli = SandboxCtlCli::try_parse_from([
            "sandboxctl",
            "--auth",
            "su:pass",
            "sandbox",
            "start",
            "dev",
            "-d",
            "--debug",
            "--http.port",
            "9090",
        ])
        .expect("parse");
        assert_eq!(cli.auth.as_deref(), Some("su:pass"));
        let Command::Sandbox(SandboxArgs {
            command: SandboxCommand::Start(args),
        }) = cli.command
        else {
            panic!("expected sandbox start");
        };
        assert_eq!(args.name.as_deref(), Some("dev"));
        assert!(args.detach);
        assert!(args.debug);
        assert!(!args.dev);
        assert!(!args.force);
        assert_eq!(args.http_port, 9090);
    }

    #[test]
    fn http_port_defaults_to_8080() {
        let cli = SandboxCtlCli::try_parse_from(["sandboxctl", "sandbox", "start"]).expect("parse");
        let Command::Sandbox(SandboxArgs {
            command: SandboxCommand::Start(args),
        }) = cli.command
        else {
            panic!("expected sandbox start");
        };
        assert_eq!(args.http_port, DEFAULT_HTTP_PORT);
        assert!(args.name.is_none());
    }

    #[test]
    fn global_auth_is_accepted_after_subcommand() {
        let cli = SandboxCtlCli::try_parse_from([
            "sandboxctl",
            "api",
            "post",
            "app/install",
            "--data",
            "{}",
            "-a",
            "user:pw",
        ])
        .expect("parse");
        assert_eq!(cli.auth.as_deref(), Some("user:pw"));
    }

    #[test]
    fn error_messages_match_user_facing_text() {
        assert_eq!(
            CliError::PortsUnavailable(vec![8080, 4848]).to_string(),
            "Port(s) 8080, 4848 are not available, stop the app(s) using them first!"
        );
        assert_eq!(
            CliError::NothingRunning.to_string(),
            "No sandbox is currently running."
        );
        assert_eq!(
            CliError::AlreadyRunning("dev".to_string()).to_string(),
            "Sandbox 'dev' is already running"
        );
        assert_eq!(
            CliError::Api {
                status: 403,
                message: "Access denied".to_string()
            }
            .to_string(),
            "403 Access denied"
        );
        assert_eq!(
            CliError::HttpStatus(reqwest::StatusCode::BAD_GATEWAY).to_string(),
            "502 Bad Gateway"
        );
    }

    #[test]
    #[serial]
    fn api_treats_non_200_success_as_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = listener.local_addr().expect("local addr");
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(&mut stream);
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("read request");
                if line.trim_end().is_empty() {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                .expect("write response");
        });

        let temp_dir = tempfile::tempdir().expect("create tempdir");
        let paths = Paths::new(temp_dir.path());
        let remotes = RemoteStore::new(paths.remotes_file());
        remotes
            .add("stub", &format!("http://{addr}"), "su", "pw")
            .expect("add remote");
        remotes.set_active("stub").expect("use remote");
        let cli = CliConfig { auth: None, paths };

        let command = ApiCommand::Get(ApiRequestArgs {
            path: "status".to_string(),
            message: None,
        });
        let err = run_api(&command, &cli, &ScriptedPrompter::default()).expect_err("201");
        assert!(
            matches!(err, CliError::HttpStatus(reqwest::StatusCode::CREATED)),
            "{err}"
        );
        server.join().expect("server");
    }
}
