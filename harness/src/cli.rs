//! CLI argument definitions for the `kafka-harness` binary.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

/// Embedded coordination service and broker.
///
/// Starts both services on loopback, creates the requested topics, prints
/// the client addresses and runs until SIGINT or SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "kafka-harness")]
#[command(version, about, long_about = None)]
pub struct HarnessCli {
    /// Path to a kafka-harness.toml file. Defaults apply when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate the configuration and exit without starting anything.
    #[arg(long)]
    pub validate: bool,

    /// Topic to create after startup, as name[:partitions[:replication]].
    /// May be repeated.
    #[arg(short, long = "topic", value_name = "TOPIC")]
    pub topics: Vec<TopicArg>,
}

/// A `--topic` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicArg {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
}

impl FromStr for TopicArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err("topic name must not be empty".to_owned());
        }
        let partitions = match parts.next() {
            Some(raw) => raw
                .parse::<i32>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| format!("invalid partition count '{raw}'"))?,
            None => 1,
        };
        let replication_factor = match parts.next() {
            Some(raw) => raw
                .parse::<i16>()
                .ok()
                .filter(|rf| *rf > 0)
                .ok_or_else(|| format!("invalid replication factor '{raw}'"))?,
            None => 1,
        };
        if parts.next().is_some() {
            return Err(format!("expected name[:partitions[:replication]], got '{s}'"));
        }

        Ok(Self {
            name: name.to_owned(),
            partitions,
            replication_factor,
        })
    }
}
