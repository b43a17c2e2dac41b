//! The surface collaborators program against.
//!
//! [`Communicate`] is the execution half (`execute`, `sudo`, `test`, `upload`,
//! `download`) and [`Guest`] adds capability dispatch. Providers implement
//! [`Capability`] and receive the guest back so they can run commands on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::connection::CommunicatorError;
use crate::exec::{Command, CommandOutput, ErrorPolicy};
use crate::family::FamilyChain;
use crate::transport::EngineFuture;

/// Value returned by a capability provider.
pub type CapabilityOutput = Value;

/// Positional JSON arguments passed to a capability.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CapabilityArgs(Vec<Value>);

impl CapabilityArgs {
    /// Wraps positional arguments.
    #[must_use]
    pub const fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// No arguments.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no arguments were passed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw argument at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// String argument at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidArgument`] when the argument is
    /// missing or not a string.
    pub fn str(&self, index: usize) -> Result<&str, CapabilityError> {
        self.get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| CapabilityError::InvalidArgument {
                index,
                message: String::from("expected a string"),
            })
    }

    /// Deserialises the argument at `index` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::InvalidArgument`] when the argument is
    /// missing or has the wrong shape.
    pub fn parse<T: DeserializeOwned>(&self, index: usize) -> Result<T, CapabilityError> {
        let value = self
            .get(index)
            .ok_or_else(|| CapabilityError::InvalidArgument {
                index,
                message: String::from("argument missing"),
            })?;
        serde_json::from_value(value.clone()).map_err(|err| CapabilityError::InvalidArgument {
            index,
            message: err.to_string(),
        })
    }
}

impl From<Vec<Value>> for CapabilityArgs {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// Errors raised by capability dispatch and providers.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CapabilityError {
    /// No family in the chain provides the capability.
    #[error("capability '{capability}' not found for family chain {chain}")]
    CapabilityNotFound {
        /// Capability requested.
        capability: String,
        /// Chain that was searched.
        chain: FamilyChain,
    },
    /// An explicit family override names a family nobody registered.
    #[error("unknown family '{family}'")]
    UnknownFamily {
        /// Family requested.
        family: String,
    },
    /// A provider argument is missing or malformed.
    #[error("invalid argument {index}: {message}")]
    InvalidArgument {
        /// Position of the argument.
        index: usize,
        /// What was wrong with it.
        message: String,
    },
    /// Running a command or transfer on the target failed.
    #[error(transparent)]
    Communicator(#[from] CommunicatorError),
    /// The provider rejected the request.
    #[error("{message}")]
    Provider {
        /// Provider message.
        message: String,
    },
}

/// Execution surface of a target.
pub trait Communicate: Send + Sync {
    /// Runs `command` and applies its error policy.
    fn run(&self, command: Command) -> EngineFuture<'_, CommandOutput, CommunicatorError>;

    /// Copies a local file or directory to `remote`.
    fn upload<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a str,
    ) -> EngineFuture<'a, (), CommunicatorError>;

    /// Copies the remote file `remote` to `local`.
    fn download<'a>(
        &'a self,
        remote: &'a str,
        local: &'a Utf8Path,
    ) -> EngineFuture<'a, (), CommunicatorError>;

    /// Runs `command` unprivileged; nonzero exits are errors.
    fn execute(&self, command: &str) -> EngineFuture<'_, i32, CommunicatorError> {
        let run = self.run(Command::new(command));
        Box::pin(async move { run.await.map(|output| output.exit_code) })
    }

    /// Runs `command` through the privileged-shell prefix; nonzero exits are
    /// errors.
    fn sudo(&self, command: &str) -> EngineFuture<'_, i32, CommunicatorError> {
        let run = self.run(Command::new(command).privileged(true));
        Box::pin(async move { run.await.map(|output| output.exit_code) })
    }

    /// Runs `command` ignoring its exit code and reports whether it was zero.
    fn test(&self, command: &str) -> EngineFuture<'_, bool, CommunicatorError> {
        let run = self.run(Command::new(command).error_policy(ErrorPolicy::Ignore));
        Box::pin(async move { run.await.map(|output| output.exit_code == 0) })
    }
}

/// A target that can also dispatch capabilities.
pub trait Guest: Communicate {
    /// Resolves `name` along the family chain and invokes the provider.
    fn capability<'a>(
        &'a self,
        name: &'a str,
        args: CapabilityArgs,
    ) -> EngineFuture<'a, CapabilityOutput, CapabilityError>;

    /// Reports whether any family in the chain provides `name`. Never fails.
    fn has_capability<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// A family-specific implementation of one capability.
pub trait Capability: Send + Sync {
    /// Runs the capability against `guest`.
    fn invoke<'a>(
        &'a self,
        guest: &'a dyn Guest,
        args: &'a CapabilityArgs,
    ) -> EngineFuture<'a, CapabilityOutput, CapabilityError>;
}

/// Signature of a provider written as a plain function.
pub type CapabilityFn =
    for<'a> fn(&'a dyn Guest, &'a CapabilityArgs) -> EngineFuture<'a, CapabilityOutput, CapabilityError>;

struct FnCapability(CapabilityFn);

impl Capability for FnCapability {
    fn invoke<'a>(
        &'a self,
        guest: &'a dyn Guest,
        args: &'a CapabilityArgs,
    ) -> EngineFuture<'a, CapabilityOutput, CapabilityError> {
        (self.0)(guest, args)
    }
}

/// Wraps a provider function for registration.
#[must_use]
pub fn provider(function: CapabilityFn) -> Arc<dyn Capability> {
    Arc::new(FnCapability(function))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Network {
        interface: u32,
        ip: String,
    }

    #[rstest]
    fn reads_string_and_typed_arguments() {
        let args = CapabilityArgs::new(vec![
            json!("web-1"),
            json!({"interface": 1, "ip": "192.168.56.10"}),
        ]);
        assert_eq!(args.str(0), Ok("web-1"));
        assert_eq!(
            args.parse::<Network>(1),
            Ok(Network {
                interface: 1,
                ip: String::from("192.168.56.10"),
            })
        );
    }

    #[rstest]
    #[case(CapabilityArgs::empty(), 0)]
    #[case(CapabilityArgs::new(vec![json!(5)]), 0)]
    fn rejects_missing_or_mistyped_strings(#[case] args: CapabilityArgs, #[case] index: usize) {
        let err = args.str(index).expect_err("not a string");
        assert!(
            matches!(err, CapabilityError::InvalidArgument { index: i, .. } if i == index),
            "{err}"
        );
    }

    #[rstest]
    fn reports_shape_errors_with_position() {
        let args = CapabilityArgs::new(vec![json!("x"), json!({"interface": "one"})]);
        let err = args.parse::<Network>(1).expect_err("wrong shape");
        assert!(
            matches!(err, CapabilityError::InvalidArgument { index: 1, .. }),
            "{err}"
        );
    }
}
