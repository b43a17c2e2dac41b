//! Binary entry point for the tether CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use camino::Utf8Path;
use clap::Parser;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tether::{
    CapabilityArgs, CapabilityError, Command, Communicate, CommunicatorError, ConfigError,
    ErrorPolicy, Guest, OutputStream, RegistryError, SshTransport, Target, TargetConfig,
    Transport, builtin_registry,
};

mod cli;

use cli::{Cli, CommandArgs};

/// Environment variable holding the log filter directives.
const LOG_ENV: &str = "TETHER_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("capability registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

/// Logs go to stderr so command output on stdout stays clean.
fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).with_target(false))
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let settings = TargetConfig::load_without_cli_args()?.settings()?;
    let transport = SshTransport::new(settings.keep_alive);
    let registry = Arc::new(builtin_registry()?);
    let target = settings.into_target(transport, registry)?;

    let result = run(&target, cli).await;
    if let Err(err) = target.close().await {
        debug!(error = %err, "disconnect failed");
    }
    result
}

async fn run<T: Transport>(target: &Target<T>, cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Exec(args) => stream(target, &args, false).await,
        Cli::Sudo(args) => stream(target, &args, true).await,
        Cli::Test(args) => {
            let passed = target.test(&command_text(&args.command)?).await?;
            Ok(i32::from(!passed))
        }
        Cli::Upload(args) => {
            target
                .upload(Utf8Path::new(&args.local), &args.remote)
                .await?;
            Ok(0)
        }
        Cli::Download(args) => {
            target
                .download(&args.remote, Utf8Path::new(&args.local))
                .await?;
            Ok(0)
        }
        Cli::Capability(command) => {
            let output = target
                .capability(&command.name, parse_capability_args(&command.args))
                .await?;
            let rendered =
                serde_json::to_string_pretty(&output).map_err(|err| CliError::Output(err.to_string()))?;
            write_line(&rendered)?;
            Ok(0)
        }
        Cli::HasCapability(command) => {
            let provided = target.has_capability(&command.name).await;
            write_line(if provided { "true" } else { "false" })?;
            Ok(0)
        }
        Cli::FamilyChain => {
            let chain = target.family_chain().await?;
            write_line(&chain.to_string())?;
            Ok(0)
        }
    }
}

/// Runs a command with its output streamed to the local terminal and
/// returns the remote exit code.
async fn stream<T: Transport>(
    target: &Target<T>,
    args: &CommandArgs,
    privileged: bool,
) -> Result<i32, CliError> {
    let command = Command::new(command_text(&args.command)?)
        .privileged(privileged)
        .error_policy(ErrorPolicy::Ignore)
        .capture(false)
        .sink(Arc::new(forward_output));
    Ok(target.run(command).await?.exit_code)
}

fn forward_output(stream: OutputStream, chunk: &str) {
    match stream {
        OutputStream::Stdout => {
            let mut stdout = io::stdout();
            stdout.write_all(chunk.as_bytes()).ok();
            stdout.flush().ok();
        }
        OutputStream::Stderr => {
            let mut stderr = io::stderr();
            stderr.write_all(chunk.as_bytes()).ok();
            stderr.flush().ok();
        }
    }
}

/// Joins the words of a command the way `ssh` does.
fn command_text(args: &[String]) -> Result<String, CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{0008}' | '\u{000B}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F except tab, or 0x7F)"
            ))));
        }
    }
    Ok(args.join(" "))
}

/// Parses every argument as JSON, falling back to a plain string.
fn parse_capability_args(args: &[String]) -> CapabilityArgs {
    CapabilityArgs::new(
        args.iter()
            .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
            .collect(),
    )
}

fn write_line(line: &str) -> Result<(), CliError> {
    writeln!(io::stdout(), "{line}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
