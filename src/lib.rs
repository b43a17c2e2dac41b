//! Remote execution engine and capability dispatch for provisioned machines.
//!
//! The crate talks to a machine over an SSH-style transport: it manages one
//! reusable session per target, runs shell commands with streamed and
//! filtered output, copies files over SCP, and dispatches named capabilities
//! (such as `change_host_name` or `configure_networks`) to the provider of
//! the most specific OS family the machine belongs to.

pub mod capability;
pub mod config;
pub mod connection;
pub mod exec;
pub mod family;
pub mod guests;
pub mod registry;
pub mod target;
pub mod test_support;
pub mod transfer;
pub mod transport;

pub use capability::{
    Capability, CapabilityArgs, CapabilityError, CapabilityFn, CapabilityOutput, Communicate,
    Guest, provider,
};
pub use config::{ConfigError, TargetConfig, TargetSettings};
pub use connection::{
    CommunicatorError, ConnectError, ConnectionManager, RetryPolicy,
};
pub use exec::{
    ChannelExecutor, Command, CommandOutput, ErrorPolicy, ExecError, OutputSink, OutputStream,
    ShellFlavor, ShellSettings,
};
pub use family::FamilyChain;
pub use guests::{GENERIC, builtin_registry, register_builtins};
pub use registry::{
    CapabilityRegistry, CommandProbe, Detect, DetectionRule, FamilyId, RegistryBuilder,
    RegistryError,
};
pub use target::Target;
pub use transfer::TransferError;
pub use transport::ssh::SshTransport;
pub use transport::{
    ChannelEvent, ConnectionParams, EngineFuture, RemoteChannel, Session, Transport,
    TransportError,
};
