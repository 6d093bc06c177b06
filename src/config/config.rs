//! Backup agent runtime configuration.

use std::path::PathBuf;

use anyerror::AnyError;
use clap::Parser;

use crate::config::error::ConfigError;

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Runtime configuration for a cluster backup agent.
///
/// `Config` carries the consensus endpoints to probe, the channels and stream
/// ids used for replay, the directory holding the durable recording log, and
/// the four deadlines that pace the agent: response timeout, re-query
/// interval, progress timeout and reset cool-down.
///
/// Create a configuration, optionally customize fields, validate it, and pass
/// it to `ClusterBackupAgent::new`:
///
/// ```
/// use cluster_backup::Config;
///
/// let config = Config {
///     cluster_consensus_endpoints: "host0:9010,host1:9010".to_string(),
///     ..Default::default()
/// }
/// .validate()?;
/// # Ok::<(), cluster_backup::ConfigError>(())
/// ```
#[derive(Clone, Debug, Parser)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Config {
    /// Comma-separated consensus endpoints of the cluster members to probe
    /// for a backup response, tried in round-robin order.
    #[clap(long, default_value = "")]
    pub cluster_consensus_endpoints: String,

    /// Channel template for consensus traffic; the endpoint of the current
    /// probe target is substituted in per query.
    #[clap(long, default_value = "backup:udp?endpoint=localhost:9010")]
    pub consensus_channel: String,

    /// Stream id for consensus traffic.
    #[clap(long, default_value = "108")]
    pub consensus_stream_id: i32,

    /// Endpoint on which this agent receives snapshot and log replay traffic.
    #[clap(long, default_value = "localhost:9510")]
    pub catchup_endpoint: String,

    /// Stream id used for snapshot replay sessions.
    #[clap(long, default_value = "103")]
    pub replay_stream_id: i32,

    /// Stream id used for the live log replay session.
    #[clap(long, default_value = "100")]
    pub log_stream_id: i32,

    /// Directory holding the recording log and mark file.
    #[clap(long, default_value = ".")]
    pub cluster_dir: PathBuf,

    /// How long to wait for a backup response from the current consensus
    /// endpoint before rotating to the next one, in nanoseconds.
    #[clap(long, default_value = "3000000000")]
    pub cluster_backup_response_timeout_ns: u64,

    /// How often the steady-state agent re-queries the leader, in nanoseconds.
    #[clap(long, default_value = "3600000000000")]
    pub cluster_backup_interval_ns: u64,

    /// How long the agent may go without progress before the backup attempt
    /// is considered stalled, in nanoseconds. Only applies before the live
    /// log recording is established.
    #[clap(long, default_value = "10000000000")]
    pub cluster_backup_progress_timeout_ns: u64,

    /// How long a failed backup attempt waits before restarting, in
    /// nanoseconds.
    #[clap(long, default_value = "30000000000")]
    pub cluster_backup_cool_down_interval_ns: u64,
}

impl Default for Config {
    fn default() -> Self {
        <Self as Parser>::parse_from(Vec::<&'static str>::new())
    }
}

impl Config {
    /// The consensus endpoints as an ordered list.
    pub fn consensus_endpoints(&self) -> Vec<String> {
        self.cluster_consensus_endpoints
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    /// Response timeout in epoch milliseconds.
    pub fn response_timeout_ms(&self) -> i64 {
        (self.cluster_backup_response_timeout_ns / NANOS_PER_MILLI) as i64
    }

    /// Steady-state re-query interval in epoch milliseconds.
    pub fn query_interval_ms(&self) -> i64 {
        (self.cluster_backup_interval_ns / NANOS_PER_MILLI) as i64
    }

    /// Progress timeout in epoch milliseconds.
    pub fn progress_timeout_ms(&self) -> i64 {
        (self.cluster_backup_progress_timeout_ns / NANOS_PER_MILLI) as i64
    }

    /// Reset cool-down interval in epoch milliseconds.
    pub fn cool_down_interval_ms(&self) -> i64 {
        (self.cluster_backup_cool_down_interval_ns / NANOS_PER_MILLI) as i64
    }

    /// Build a `Config` instance from a series of command line arguments.
    ///
    /// The first element in `args` must be the application name.
    pub fn build(args: &[&str]) -> Result<Config, ConfigError> {
        let config = <Self as Parser>::try_parse_from(args).map_err(|e| ConfigError::ParseError {
            source: AnyError::from(&e),
            args: args.iter().map(|x| x.to_string()).collect(),
        })?;
        config.validate()
    }

    /// Validate the state of this config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.cluster_consensus_endpoints.is_empty() {
            return Err(ConfigError::NoConsensusEndpoints);
        }

        if self.cluster_consensus_endpoints.split(',').any(|s| s.is_empty()) {
            return Err(ConfigError::EmptyConsensusEndpoint {
                csv: self.cluster_consensus_endpoints.clone(),
            });
        }

        for (name, value) in [
            ("cluster_backup_response_timeout_ns", self.cluster_backup_response_timeout_ns),
            ("cluster_backup_interval_ns", self.cluster_backup_interval_ns),
            ("cluster_backup_progress_timeout_ns", self.cluster_backup_progress_timeout_ns),
            (
                "cluster_backup_cool_down_interval_ns",
                self.cluster_backup_cool_down_interval_ns,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        if self.cluster_backup_progress_timeout_ns <= self.cluster_backup_response_timeout_ns {
            return Err(ConfigError::ProgressTimeoutLTResponseTimeout {
                progress_timeout_ns: self.cluster_backup_progress_timeout_ns,
                response_timeout_ns: self.cluster_backup_response_timeout_ns,
            });
        }

        Ok(self)
    }
}
