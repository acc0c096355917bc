//! Command line entry point
//!
//! `recovery list` prints the catalog, `recovery run` executes scenarios one
//! after another. Every report or failure is printed to stdout as one JSON line.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};

use crate::cluster::KubeCluster;
use crate::config::HarnessConfig;
use crate::scenario::{catalog, select, ScenarioRunner, ScenarioTag};
use crate::telemetry::LogFormat;
use crate::{Error, Result};

/// Recovery - verify an operator restores what it owns
#[derive(Parser, Debug)]
#[command(name = "recovery", version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "RECOVERY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Kubeconfig to use instead of the inferred one
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace the operator and its clusters live in
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Log output format (json or text)
    #[arg(long, global = true, default_value = "json", env = "RECOVERY_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List known scenarios
    List {
        /// Only scenarios with this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Run scenarios sequentially
    ///
    /// Scenarios are selected by name, by tag, or all of them with --all.
    Run {
        /// Scenario names
        names: Vec<String>,

        /// Run every scenario with this tag
        #[arg(long)]
        tag: Option<String>,

        /// Run every scenario
        #[arg(long, conflicts_with_all = ["names", "tag"])]
        all: bool,
    },
}

impl Cli {
    /// Effective configuration: file and environment, then command line flags
    pub fn load_config(&self) -> Result<HarnessConfig> {
        let mut config = HarnessConfig::load(self.config.as_deref())?;
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            config.kubeconfig = Some(kubeconfig.clone());
        }
        config.validate()?;
        Ok(config)
    }

    /// Execute the command. Returns `false` if any scenario failed.
    pub async fn run(self) -> Result<bool> {
        let config = self.load_config()?;
        match self.command {
            Command::List { tag } => {
                let tag = tag.as_deref().map(ScenarioTag::parse).transpose()?;
                for scenario in catalog(&config) {
                    if tag.is_some_and(|t| !scenario.has_tag(t)) {
                        continue;
                    }
                    print_line(&json!({
                        "name": scenario.name,
                        "tags": scenario.tags,
                        "target": scenario.target().to_string(),
                    }))?;
                }
                Ok(true)
            }
            Command::Run { names, tag, all } => {
                let tag = tag.as_deref().map(ScenarioTag::parse).transpose()?;
                let scenarios = catalog(&config);
                let selected = select(&scenarios, &names, tag, all)?;
                if selected.is_empty() {
                    return Err(Error::validation(
                        "no scenarios selected; pass names, --tag or --all",
                    ));
                }

                let cluster = Arc::new(KubeCluster::connect(config.kubeconfig.as_deref()).await?);
                let mut runner = ScenarioRunner::new(config, cluster.clone(), cluster);

                let mut failed = 0usize;
                for scenario in &selected {
                    match runner.run(scenario).await {
                        Ok(report) => {
                            let mut line = serde_json::to_value(&report)
                                .map_err(|e| Error::serialization(e.to_string()))?;
                            line["status"] = json!("recovered");
                            print_line(&line)?;
                        }
                        Err(e) => {
                            failed += 1;
                            error!(scenario = %scenario.name, error = %e, "Scenario failed");
                            print_line(&json!({
                                "scenario": scenario.name,
                                "target": scenario.target().to_string(),
                                "status": "failed",
                                "error": e.to_string(),
                            }))?;
                        }
                    }
                }
                info!(total = selected.len(), failed, "Run complete");
                Ok(failed == 0)
            }
        }
    }
}

fn print_line(value: &serde_json::Value) -> Result<()> {
    let line = serde_json::to_string(value).map_err(|e| Error::serialization(e.to_string()))?;
    println!("{line}");
    Ok(())
}
