//! Build script for generating the `tether` man pages.
//!
//! Writes one `tether-<subcommand>.1` page per subcommand, then `tether.1`
//! with ENVIRONMENT and FILES sections describing how the target is
//! configured.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use clap::CommandFactory;
use clap_mangen::Man;
use clap_mangen::roff::{Roff, bold, roman};

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

/// Settings read from the environment; keep in step with `TargetConfig`.
const ENVIRONMENT: &[(&str, &str)] = &[
    ("TETHER_HOST", "Address of the target. Required."),
    ("TETHER_PORT", "SSH port (default 22)."),
    ("TETHER_USERNAME", "Login user (default root)."),
    (
        "TETHER_PRIVATE_KEY_PATH",
        "Comma-separated private keys tried in order; a leading ~/ is expanded.",
    ),
    ("TETHER_PASSWORD", "Password tried after every key failed."),
    ("TETHER_SHELL", "Login shell started for every command (default bash -l)."),
    (
        "TETHER_SUDO_COMMAND",
        "Privileged-shell prefix; %c is replaced by the shell (default sudo -E -H %c).",
    ),
    ("TETHER_SHELL_FLAVOR", "posix, powershell or cmd (default posix)."),
    (
        "TETHER_BANNER_MARKER",
        "Drop login banners by waiting for a marker on both output streams.",
    ),
    ("TETHER_MAX_TRIES", "Connect attempts made for transient failures (default 5)."),
    (
        "TETHER_CONNECT_TIMEOUT_SECS",
        "Deadline of one connect attempt in seconds; must be at least 1 (default 15).",
    ),
    ("TETHER_RETRY_DELAY_MS", "Pause between connect attempts (default 1000)."),
    ("TETHER_SETTLE_DELAY_MS", "Pause after a successful connect (default 500)."),
    ("TETHER_KEEP_ALIVE_SECS", "Keep-alive interval; 0 disables keep-alives (default 5)."),
    (
        "TETHER_IDLE_PROBE_SECS",
        "Idle time after which a cached session is checked before reuse (default 0).",
    ),
    ("TETHER_FORWARD_AGENT", "Forward the local agent into privileged shells."),
    (
        "TETHER_FIX_KEY_PERMISSIONS",
        "Tighten loose key permissions to 0600 instead of failing (default true).",
    ),
    ("TETHER_FAMILY", "Skip detection and pin the target to this family."),
    ("TETHER_CONFIG_PATH", "Explicit path of the configuration file."),
    ("RUST_LOG", "Log filter for diagnostics on stderr (default warn)."),
];

fn environment_section() -> String {
    let mut roff = Roff::new();
    roff.control("SH", ["ENVIRONMENT"]);
    for (name, description) in ENVIRONMENT {
        roff.control("TP", []);
        roff.text([bold(*name)]);
        roff.text([roman(*description)]);
    }
    roff.control("SH", ["FILES"]);
    roff.text([roman(
        "Settings are also read from tether.toml in the working directory, \
         .tether.toml in the home directory and tether/tether.toml under the \
         XDG configuration directory, using the variable names above in lower \
         case without the TETHER_ prefix.",
    )]);
    roff.to_roff()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);

    // One page per subcommand, named after its display name.
    clap_mangen::generate_to(Cli::command(), &out_dir)?;

    let mut buffer = Vec::new();
    Man::new(Cli::command()).render(&mut buffer)?;
    buffer.extend_from_slice(environment_section().as_bytes());

    let mut file = File::create(out_dir.join("tether.1"))?;
    file.write_all(&buffer)?;

    Ok(())
}
