mod session;
pub mod ssh;

#[cfg(feature = "memory")]
pub mod memory;

pub use session::{
    Connector, ErrorClass, ExecOutput, RemoteEntry, RemoteSession, RemoteStat, SessionConfig,
    SessionError, join_remote, modified_secs,
};
pub use ssh::{SshConnector, SshSession};
