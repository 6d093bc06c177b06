use anyerror::AnyError;

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error)]
#[derive(PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse configuration from command-line arguments.
    #[error("ParseError: {source} while parsing ({args:?})")]
    ParseError {
        /// The underlying parse error.
        source: AnyError,
        /// The arguments that failed to parse.
        args: Vec<String>,
    },

    /// No consensus endpoint was configured.
    #[error("cluster_consensus_endpoints must name at least one endpoint")]
    NoConsensusEndpoints,

    /// An endpoint entry in the CSV list was empty.
    #[error("cluster_consensus_endpoints contains an empty entry: {csv:?}")]
    EmptyConsensusEndpoint {
        /// The offending CSV string.
        csv: String,
    },

    /// A timeout or interval option was zero.
    #[error("{name} must be > 0")]
    ZeroDuration {
        /// Which option was zero.
        name: &'static str,
    },

    /// The progress timeout does not dominate the response timeout, so a
    /// response wait could be reported as a stall.
    #[error(
        "cluster_backup_progress_timeout_ns({progress_timeout_ns}) must be > \
         cluster_backup_response_timeout_ns({response_timeout_ns})"
    )]
    ProgressTimeoutLTResponseTimeout {
        /// Configured progress timeout in nanoseconds.
        progress_timeout_ns: u64,
        /// Configured response timeout in nanoseconds.
        response_timeout_ns: u64,
    },
}
