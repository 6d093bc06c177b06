use crate::config::ConfigError;
use crate::Config;

#[test]
fn test_config_defaults() {
    let cfg = Config::default();

    assert_eq!("", cfg.cluster_consensus_endpoints);
    assert_eq!(108, cfg.consensus_stream_id);
    assert_eq!(103, cfg.replay_stream_id);
    assert_eq!(100, cfg.log_stream_id);

    assert_eq!(3_000, cfg.response_timeout_ms());
    assert_eq!(3_600_000, cfg.query_interval_ms());
    assert_eq!(10_000, cfg.progress_timeout_ms());
    assert_eq!(30_000, cfg.cool_down_interval_ms());
}

#[test]
fn test_validate_requires_endpoints() {
    let res = Config::default().validate();
    assert_eq!(res.unwrap_err(), ConfigError::NoConsensusEndpoints);

    let config = Config {
        cluster_consensus_endpoints: "a:1,,b:2".to_string(),
        ..Default::default()
    };
    let err = config.validate().unwrap_err();
    assert_eq!(err, ConfigError::EmptyConsensusEndpoint {
        csv: "a:1,,b:2".to_string()
    });
}

#[test]
fn test_validate_rejects_zero_durations() {
    let config = Config {
        cluster_consensus_endpoints: "a:1".to_string(),
        cluster_backup_interval_ns: 0,
        ..Default::default()
    };

    let err = config.validate().unwrap_err();
    assert_eq!(err, ConfigError::ZeroDuration {
        name: "cluster_backup_interval_ns"
    });
}

#[test]
fn test_validate_requires_progress_timeout_above_response_timeout() {
    let config = Config {
        cluster_consensus_endpoints: "a:1".to_string(),
        cluster_backup_response_timeout_ns: 5_000_000_000,
        cluster_backup_progress_timeout_ns: 5_000_000_000,
        ..Default::default()
    };

    let err = config.validate().unwrap_err();
    assert_eq!(err, ConfigError::ProgressTimeoutLTResponseTimeout {
        progress_timeout_ns: 5_000_000_000,
        response_timeout_ns: 5_000_000_000,
    });
}

#[test]
fn test_build() -> anyhow::Result<()> {
    let config = Config::build(&[
        "backup",
        "--cluster-consensus-endpoints=h0:9010,h1:9010",
        "--consensus-channel=backup:udp?endpoint=unset",
        "--consensus-stream-id=208",
        "--catchup-endpoint=me:9510",
        "--replay-stream-id=203",
        "--log-stream-id=200",
        "--cluster-dir=/tmp/backup",
        "--cluster-backup-response-timeout-ns=1000000",
        "--cluster-backup-interval-ns=2000000",
        "--cluster-backup-progress-timeout-ns=3000000",
        "--cluster-backup-cool-down-interval-ns=4000000",
    ])?;

    assert_eq!(vec!["h0:9010".to_string(), "h1:9010".to_string()], config.consensus_endpoints());
    assert_eq!(208, config.consensus_stream_id);
    assert_eq!("me:9510", config.catchup_endpoint);
    assert_eq!(203, config.replay_stream_id);
    assert_eq!(200, config.log_stream_id);
    assert_eq!(1, config.response_timeout_ms());
    assert_eq!(2, config.query_interval_ms());
    assert_eq!(3, config.progress_timeout_ms());
    assert_eq!(4, config.cool_down_interval_ms());

    Ok(())
}
