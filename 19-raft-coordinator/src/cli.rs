use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{ClientConfig, NodeConfig, parse_members};

/// Runs one cluster member.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct NodeCli {
    /// JSON config file; flags given on the command line override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// This node's id and listen address, e.g. 127.0.0.1:8868.
    #[arg(long)]
    pub server_id: Option<String>,

    /// Comma-separated member list, including this node.
    #[arg(long)]
    pub members: Option<String>,

    /// Directory for the applied state and the term/vote record.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Directory for the replicated log.
    #[arg(long)]
    pub binlog_dir: Option<PathBuf>,
}

impl NodeCli {
    pub fn into_config(self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_json_file(path)?,
            None => NodeConfig::default(),
        };
        if let Some(server_id) = self.server_id {
            config.server_id = server_id;
        }
        if let Some(members) = self.members {
            config.members = parse_members(&members);
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(binlog_dir) = self.binlog_dir {
            config.binlog_dir = binlog_dir;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Talks to a running cluster.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct ClientCli {
    /// Comma-separated member list.
    #[arg(long, default_value = "127.0.0.1:8868")]
    pub members: String,

    /// Namespace for every key this client touches.
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Accept answers from followers for reads.
    #[arg(long)]
    pub stale: bool,

    /// One-shot command; without it the client starts an interactive shell.
    #[command(subcommand)]
    pub command: Option<ClientCommand>,
}

impl ClientCli {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            namespace: self.namespace.clone(),
            stale_reads: self.stale,
            ..ClientConfig::new(parse_members(&self.members))
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Store a value.
    Put(KeyValueArgs),
    /// Read a value.
    Get(KeyArgs),
    /// Remove a key.
    Delete(KeyArgs),
    /// List keys in [start, end).
    Scan(ScanArgs),
    /// Wait for the next change of a key.
    Watch(KeyArgs),
    /// Show every member's role and progress.
    Show,
    /// Show the leader's per-operation throughput.
    Stat,
    /// Drop log slots below an index on every member.
    Clean(CleanArgs),
    /// Start the interactive shell (the default).
    Shell,
}

#[derive(Args, Debug, Clone)]
pub struct KeyArgs {
    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct KeyValueArgs {
    pub key: String,
    pub value: String,
}

#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    pub start: String,
    /// Exclusive upper bound; omit for no bound.
    #[arg(default_value = "")]
    pub end: String,
}

#[derive(Args, Debug, Clone)]
pub struct CleanArgs {
    pub end_index: i64,
}
