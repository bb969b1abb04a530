use std::net::IpAddr;
use thiserror::Error;

/// Errors that can occur while launching work across the cluster.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cluster reported no accelerator units to dispatch onto
    #[error("No accelerators available in the cluster")]
    NoAccelerators,

    /// A rank function returned an error or panicked on its worker
    #[error("Rank {rank} failed: {source}")]
    Remote {
        rank: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// Rank 0 was not scheduled onto the coordinator node
    #[error("Rank {rank} placed on {node}, expected coordinator node {coordinator}")]
    Placement {
        rank: usize,
        node: IpAddr,
        coordinator: IpAddr,
    },

    /// A split function returned a different number of outputs than it got tasks
    #[error("Rank {rank} returned {got} results for {expected} tasks")]
    ResultLength {
        rank: usize,
        expected: usize,
        got: usize,
    },

    /// Scheduler error (client shut down, unknown node, lost task)
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Registered address could not be parsed
    #[error("Address error: {0}")]
    Address(String),

    /// Process group rendezvous failed
    #[error("Process group error: {0}")]
    ProcessGroup(String),

    /// IO error occurred (config files, log directories)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl LaunchError {
    /// Wrap an error raised by a rank function.
    pub fn remote(rank: usize, error: anyhow::Error) -> Self {
        LaunchError::Remote {
            rank,
            source: error.into(),
        }
    }

    /// Rank that caused this error, if it came from a worker.
    pub fn rank(&self) -> Option<usize> {
        match self {
            LaunchError::Remote { rank, .. }
            | LaunchError::Placement { rank, .. }
            | LaunchError::ResultLength { rank, .. } => Some(*rank),
            _ => None,
        }
    }
}

/// Result type alias for launch operations.
pub type Result<T> = std::result::Result<T, LaunchError>;
