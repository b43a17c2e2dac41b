//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::capability::CapabilityError;
use crate::connection::{ConnectionManager, RetryPolicy};
use crate::exec::{ChannelExecutor, ShellFlavor, ShellSettings};
use crate::registry::CapabilityRegistry;
use crate::target::Target;
use crate::transport::{ConnectionParams, Transport};

/// Connection, shell and retry settings of one target, derived from
/// environment variables and configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TETHER",
    discovery(
        app_name = "tether",
        env_var = "TETHER_CONFIG_PATH",
        config_file_name = "tether.toml",
        dotfile_name = ".tether.toml",
        project_file_name = "tether.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "configuration struct with user-facing toggles that are naturally booleans"
)]
pub struct TargetConfig {
    /// Address of the target. Required.
    pub host: Option<String>,
    /// SSH port.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Login user.
    #[ortho_config(default = "root".to_owned())]
    pub username: String,
    /// Comma-separated private key paths; a leading `~/` is expanded.
    pub private_key_path: Option<String>,
    /// Password tried after every key failed.
    pub password: Option<String>,
    /// Login shell started for every command.
    #[ortho_config(default = "bash -l".to_owned())]
    pub shell: String,
    /// Privileged-shell prefix; `%c` is replaced by the shell.
    #[ortho_config(default = "sudo -E -H %c".to_owned())]
    pub sudo_command: String,
    /// `posix`, `powershell` or `cmd`.
    #[ortho_config(default = "posix".to_owned())]
    pub shell_flavor: String,
    /// Filters login banners by waiting for a marker on both streams.
    #[ortho_config(default = false)]
    pub banner_marker: bool,
    /// Connect attempts made for transient failures.
    #[ortho_config(default = 5)]
    pub max_tries: u32,
    /// Deadline of one connect attempt, in seconds.
    #[ortho_config(default = 15)]
    pub connect_timeout_secs: u64,
    /// Pause between connect attempts, in milliseconds.
    #[ortho_config(default = 1000)]
    pub retry_delay_ms: u64,
    /// Pause after a successful connect, in milliseconds.
    #[ortho_config(default = 500)]
    pub settle_delay_ms: u64,
    /// Keep-alive interval in seconds; 0 disables keep-alives.
    #[ortho_config(default = 5)]
    pub keep_alive_secs: u64,
    /// Idle time in seconds after which a cached session is probed before
    /// reuse; 0 probes on every reuse.
    #[ortho_config(default = 0)]
    pub idle_probe_secs: u64,
    /// Forwards the local agent into privileged shells.
    #[ortho_config(default = false)]
    pub forward_agent: bool,
    /// Tightens the permissions of owned key files instead of failing.
    #[ortho_config(default = true)]
    pub fix_key_permissions: bool,
    /// Skips detection and pins the target to this family.
    pub family: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to tether.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

/// Engine settings produced from a validated [`TargetConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetSettings {
    /// Transport connection parameters.
    pub params: ConnectionParams,
    /// Connect retry policy.
    pub retry: RetryPolicy,
    /// Shell and privilege settings for the executor.
    pub shell: ShellSettings,
    /// Transport keep-alive interval, if enabled.
    pub keep_alive: Option<Duration>,
    /// Idle time before a cached session is probed.
    pub idle_probe: Duration,
    /// Whether loose key permissions are repaired.
    pub repair_keys: bool,
    /// Pinned family, if any.
    pub family: Option<String>,
}

impl TargetSettings {
    /// Assembles a [`Target`] on top of `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::UnknownFamily`] when the pinned family is
    /// not registered.
    pub fn into_target<T: Transport>(
        self,
        transport: T,
        registry: Arc<CapabilityRegistry>,
    ) -> Result<Target<T>, CapabilityError> {
        let name = self.params.endpoint();
        let manager = ConnectionManager::new(transport, self.params, ChannelExecutor::new(self.shell))
            .with_retry_policy(self.retry)
            .with_idle_probe(self.idle_probe)
            .with_key_repair(self.repair_keys);
        let target = Target::new(name, manager, registry);
        match self.family.as_deref() {
            Some(family) => target.with_family(family),
            None => Ok(target),
        }
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

impl TargetConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("tether")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Key paths from `private_key_path`, split on commas and expanded.
    #[must_use]
    pub fn private_keys(&self) -> Vec<Utf8PathBuf> {
        self.private_key_path
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(|path| Utf8PathBuf::from(expand_tilde(path)))
            .collect()
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                self.host.as_deref().unwrap_or_default(),
                FieldMetadata::new("target host", "TETHER_HOST", "host"),
            ),
            (
                self.username.as_str(),
                FieldMetadata::new("login user", "TETHER_USERNAME", "username"),
            ),
            (
                self.shell.as_str(),
                FieldMetadata::new("login shell", "TETHER_SHELL", "shell"),
            ),
            (
                self.sudo_command.as_str(),
                FieldMetadata::new("privileged shell prefix", "TETHER_SUDO_COMMAND", "sudo_command"),
            ),
        ];
        for (value, metadata) in &required {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "port must be between 1 and 65535 (TETHER_PORT)",
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "connect_timeout_secs must be at least 1 (TETHER_CONNECT_TIMEOUT_SECS)",
            )));
        }
        if !self.sudo_command.contains("%c") {
            return Err(ConfigError::Invalid(format!(
                "sudo_command '{}' must contain %c where the shell goes (TETHER_SUDO_COMMAND)",
                self.sudo_command
            )));
        }
        self.shell_flavor
            .parse::<ShellFlavor>()
            .map_err(ConfigError::Invalid)?;
        if self
            .family
            .as_deref()
            .is_some_and(|family| family.trim().is_empty())
        {
            return Err(ConfigError::Invalid(String::from(
                "family must not be empty when set (TETHER_FAMILY)",
            )));
        }
        Ok(())
    }

    /// Validates the configuration and converts it into engine settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn settings(&self) -> Result<TargetSettings, ConfigError> {
        self.validate()?;
        let host = self
            .host
            .as_deref()
            .map(str::trim)
            .unwrap_or_default();
        let mut params = ConnectionParams::new(host, self.port, self.username.trim());
        for key in self.private_keys() {
            params = params.with_private_key(key);
        }
        if let Some(password) = &self.password {
            params = params.with_password(password.clone());
        }
        let flavor = self
            .shell_flavor
            .parse::<ShellFlavor>()
            .map_err(ConfigError::Invalid)?;

        Ok(TargetSettings {
            params,
            retry: RetryPolicy {
                max_tries: self.max_tries.max(1),
                retry_delay: Duration::from_millis(self.retry_delay_ms),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                settle_delay: Duration::from_millis(self.settle_delay_ms),
            },
            shell: ShellSettings {
                shell: self.shell.clone(),
                sudo_command: self.sudo_command.clone(),
                flavor,
                banner_marker: self.banner_marker,
                forward_agent: self.forward_agent,
            },
            keep_alive: (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs)),
            idle_probe: Duration::from_secs(self.idle_probe_secs),
            repair_keys: self.fix_key_permissions,
            family: self.family.as_deref().map(|family| family.trim().to_owned()),
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
