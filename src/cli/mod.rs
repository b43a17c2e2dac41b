//! Command-line interface definitions for the `tether` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `tether` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tether",
    about = "Run commands, transfer files and invoke OS capabilities on a remote machine over SSH",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a shell command and exit with its exit code.
    #[command(name = "exec", about = "Run a shell command and exit with its exit code")]
    Exec(CommandArgs),
    /// Run a shell command through the privileged-shell prefix.
    #[command(name = "sudo", about = "Run a shell command with elevated privileges")]
    Sudo(CommandArgs),
    /// Exit 0 when a command succeeds on the target and 1 otherwise.
    #[command(name = "test", about = "Exit 0 when a command succeeds on the target, 1 otherwise")]
    Test(CommandArgs),
    /// Copy a local file or directory to the target.
    #[command(name = "upload", about = "Copy a local file or directory to the target")]
    Upload(UploadArgs),
    /// Copy a remote file to the local machine.
    #[command(name = "download", about = "Copy a remote file to the local machine")]
    Download(DownloadArgs),
    /// Invoke a capability and print its JSON result.
    #[command(name = "capability", about = "Invoke a capability and print its JSON result")]
    Capability(CapabilityCommand),
    /// Print whether the target provides a capability.
    #[command(name = "has-capability", about = "Print whether the target provides a capability")]
    HasCapability(HasCapabilityCommand),
    /// Print the detected family chain.
    #[command(name = "family-chain", about = "Print the detected family chain")]
    FamilyChain,
}

/// Arguments shared by `exec`, `sudo` and `test`.
#[derive(Debug, Parser)]
pub(crate) struct CommandArgs {
    /// Shell command text; multiple words are joined with spaces, as `ssh`
    /// does (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `tether upload`.
#[derive(Debug, Parser)]
pub(crate) struct UploadArgs {
    /// Local file or directory.
    #[arg(value_name = "LOCAL")]
    pub(crate) local: String,
    /// Destination path on the target.
    #[arg(value_name = "REMOTE")]
    pub(crate) remote: String,
}

/// Arguments for `tether download`.
#[derive(Debug, Parser)]
pub(crate) struct DownloadArgs {
    /// Remote file.
    #[arg(value_name = "REMOTE")]
    pub(crate) remote: String,
    /// Local destination path.
    #[arg(value_name = "LOCAL")]
    pub(crate) local: String,
}

/// Arguments for `tether capability`.
#[derive(Debug, Parser)]
pub(crate) struct CapabilityCommand {
    /// Capability name, e.g. `change_host_name`.
    pub(crate) name: String,
    /// Positional arguments. Each is parsed as JSON; anything that is not
    /// valid JSON is passed as a string.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) args: Vec<String>,
}

/// Arguments for `tether has-capability`.
#[derive(Debug, Parser)]
pub(crate) struct HasCapabilityCommand {
    /// Capability name.
    pub(crate) name: String,
}
