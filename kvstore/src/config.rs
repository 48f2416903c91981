use clap::Parser;
use log::warn;
use serde_derive::Deserialize;
use std::path::PathBuf;

/// Command line flags. Anything given here overrides the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the runtime config file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,

    /// Node id, overrides `id` in the config file
    #[arg(long)]
    pub id: Option<u64>,

    /// Join an existing cluster instead of bootstrapping a new one
    #[arg(long)]
    pub join: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NodeConfig {
    pub id: u64,
    /// Base URL of the node's raft transport, e.g. `http://127.0.0.1:12379`
    pub addr: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub id: u64,
    pub join: bool,
    pub addr: String,
    pub raft_addr: String,
    pub metrics_addr: String,
    pub base_path: String,
    pub snapshot_count: u64,
    pub snapshot_catch_up_entries: u64,
    pub node_list: Vec<NodeConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            id: 1,
            join: false,
            addr: "0.0.0.0:12380".to_string(),
            raft_addr: "0.0.0.0:12379".to_string(),
            metrics_addr: "0.0.0.0:12390".to_string(),
            base_path: "data".to_string(),
            snapshot_count: 10000,
            snapshot_catch_up_entries: 10000,
            node_list: Vec::new(),
        }
    }

    pub fn from_toml(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return RuntimeConfig::new();
            }
        };
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Self {
        match toml::from_str(contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong parsing the runtime config file, {:?}",
                    e
                );
                RuntimeConfig::new()
            }
        }
    }

    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(id) = args.id {
            self.id = id;
        }
        self.join |= args.join;
        self
    }

    /// Ids of the voters a fresh cluster is bootstrapped with.
    pub fn voters(&self) -> Vec<u64> {
        if self.node_list.is_empty() {
            return vec![self.id];
        }
        self.node_list.iter().map(|n| n.id).collect()
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_path).join(format!("kvstore-{}-snap", self.id))
    }
}
