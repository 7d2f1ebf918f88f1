//! Environment-driven configuration
//!
//! Every setting is read from a `ROLLER_*` environment variable (or the
//! matching command-line flag). `ROLLER_ASG` is the only required key.

use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::error::Error;
use crate::{Result, DEFAULT_INTERVAL};

/// Runtime configuration for the roller
#[derive(Parser, Debug, Clone)]
#[command(name = "aws-asg-roller", version, about, long_about = None)]
pub struct Config {
    /// Comma-separated list of auto-scaling group names to manage
    #[arg(long = "asg", env = "ROLLER_ASG", value_delimiter = ',', required = true)]
    pub groups: Vec<String>,

    /// Time between reconcile passes, e.g. "30s" or "2m"
    #[arg(long, env = "ROLLER_INTERVAL")]
    pub interval: Option<String>,

    /// Legacy integer-seconds form of the interval; a bare number is
    /// promoted by appending "s"
    #[arg(long, env = "ROLLER_CHECK_DELAY")]
    pub check_delay: Option<String>,

    /// Enable the Kubernetes readiness integration
    #[arg(long, env = "ROLLER_KUBERNETES", default_value_t = true, action = ArgAction::Set)]
    pub kubernetes: bool,

    /// Leave DaemonSet-managed pods in place when draining
    #[arg(long, env = "ROLLER_IGNORE_DAEMONSETS", default_value_t = false, action = ArgAction::Set)]
    pub ignore_daemonsets: bool,

    /// Permit eviction of pods using emptyDir volumes during a drain
    #[arg(long, env = "ROLLER_DELETE_LOCAL_DATA", default_value_t = false, action = ArgAction::Set)]
    pub delete_local_data: bool,

    /// Drain nodes before termination; false performs a cordon only
    #[arg(long, env = "ROLLER_DRAIN", default_value_t = true, action = ArgAction::Set)]
    pub drain: bool,

    /// Permit eviction of pods that have no managing controller
    #[arg(long, env = "ROLLER_DRAIN_FORCE", default_value_t = false, action = ArgAction::Set)]
    pub drain_force: bool,

    /// Persist the pre-roll desired count as a tag on each group
    #[arg(long, env = "ROLLER_ORIGINAL_DESIRED_ON_TAG", default_value_t = false, action = ArgAction::Set)]
    pub original_desired_on_tag: bool,

    /// Permit raising a group's max size when desired+1 would exceed it
    #[arg(long, env = "ROLLER_CAN_INCREASE_MAX", default_value_t = false, action = ArgAction::Set)]
    pub can_increase_max: bool,

    /// Verbose (debug) logging
    #[arg(long, env = "ROLLER_VERBOSE", default_value_t = false, action = ArgAction::Set)]
    pub verbose: bool,
}

impl Config {
    /// Validate the configuration and return the trimmed group list.
    ///
    /// Rejects an empty list, which clap cannot catch when `ROLLER_ASG`
    /// is set but blank.
    pub fn group_names(&self) -> Result<Vec<String>> {
        let names: Vec<String> = self
            .groups
            .iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();
        if names.is_empty() {
            return Err(Error::config(
                "must supply at least one group name in ROLLER_ASG",
            ));
        }
        Ok(names)
    }

    /// Resolve the effective interval between reconcile passes.
    ///
    /// `ROLLER_INTERVAL` wins; otherwise `ROLLER_CHECK_DELAY` is honoured,
    /// with a bare integer promoted to seconds.
    pub fn effective_interval(&self) -> Result<Duration> {
        if let Some(raw) = &self.interval {
            return humantime::parse_duration(raw)
                .map_err(|e| Error::config(format!("invalid ROLLER_INTERVAL '{raw}': {e}")));
        }
        if let Some(raw) = &self.check_delay {
            let promoted = if raw.chars().all(|c| c.is_ascii_digit()) && !raw.is_empty() {
                format!("{raw}s")
            } else {
                raw.clone()
            };
            return humantime::parse_duration(&promoted)
                .map_err(|e| Error::config(format!("invalid ROLLER_CHECK_DELAY '{raw}': {e}")));
        }
        Ok(DEFAULT_INTERVAL)
    }
}
