//! RKE
//!
//! Declarative Kubernetes cluster provisioner. Reads a cluster file,
//! connects to every host over SSH, and converges etcd, the control plane,
//! the workers and the cluster addons to the described state.

mod addons;
mod backoff;
mod cloud;
mod config;
mod datastore;
mod deployers;
mod encryption;
mod engine;
mod error;
mod hosts;
mod metadata;
mod operator;
mod providers;
mod services;
mod templates;
#[cfg(test)]
mod test_utils;

use crate::config::RuntimeConfig;
use crate::engine::summary::RunSummary;
use crate::engine::{Engine, LiveConnectors, RunOptions};
use crate::error::EngineError;
use crate::metadata::{Catalog, DEFAULT_KUBERNETES_VERSION};
use crate::providers::ProviderRegistry;
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use cluster_types::{ClusterSpec, S3BackupConfig};
use datastore_client::snapshot::default_snapshot_name;
use host_driver::{SshDialer, SshOptions};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "rke", version, about = "Declarative Kubernetes cluster provisioner")]
struct Cli {
    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(long, global = true, conflicts_with = "debug")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ConfigPath {
    /// Cluster file
    #[arg(long = "config", env = "RKE_CONFIG", default_value = "cluster.yml")]
    path: PathBuf,
}

#[derive(Debug, Args)]
struct S3Flags {
    /// Upload to or fetch from S3
    #[arg(long)]
    s3: bool,
    #[arg(long, default_value = cluster_types::defaults::DEFAULT_S3_ENDPOINT)]
    s3_endpoint: String,
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key: Option<String>,
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_key: Option<String>,
    #[arg(long)]
    bucket_name: Option<String>,
    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    folder: Option<String>,
}

impl S3Flags {
    fn backup_config(&self) -> Result<Option<S3BackupConfig>> {
        if !self.s3 {
            return Ok(None);
        }
        let Some(bucket_name) = self.bucket_name.clone() else {
            bail!("--bucket-name is required with --s3");
        };
        Ok(Some(S3BackupConfig {
            access_key: self.access_key.clone().unwrap_or_default(),
            secret_key: self.secret_key.clone().unwrap_or_default(),
            bucket_name,
            region: self.region.clone().unwrap_or_default(),
            endpoint: self.s3_endpoint.clone(),
            folder: self.folder.clone().unwrap_or_default(),
        }))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bring the cluster to the state of the cluster file
    Up {
        #[command(flatten)]
        config: ConfigPath,
        /// Only change worker-only hosts
        #[arg(long)]
        update_only: bool,
        /// Skip the free port check on new hosts
        #[arg(long)]
        disable_port_check: bool,
    },
    /// Tear down the cluster and delete its local state
    Remove {
        #[command(flatten)]
        config: ConfigPath,
        /// Do not ask for confirmation
        #[arg(long)]
        force: bool,
    },
    /// etcd snapshots
    Etcd {
        #[command(subcommand)]
        command: EtcdCommand,
    },
    /// Certificate management
    Cert {
        #[command(subcommand)]
        command: CertCommand,
    },
    /// Generate a cluster file
    Config {
        /// Print to stdout instead of writing the file
        #[arg(long)]
        print: bool,
        /// File to write
        #[arg(long, default_value = "cluster.yml")]
        name: PathBuf,
        /// Print the JSON schema of the cluster file
        #[arg(long)]
        schema: bool,
        /// Read hosts through a node-source provider
        #[arg(long, requires = "input")]
        provider: Option<String>,
        /// Provider input, e.g. an inventory file
        #[arg(long)]
        input: Option<String>,
        /// Print the system images of `--version` (default release otherwise)
        #[arg(long)]
        system_images: bool,
        /// Print the default Kubernetes version
        #[arg(long)]
        list_version: bool,
        /// With `--list-version`, print every supported version
        #[arg(long, requires = "list_version")]
        all: bool,
        /// Kubernetes version for `--system-images`
        #[arg(long)]
        version: Option<String>,
    },
    /// Print the tool and cluster versions
    Version {
        #[command(flatten)]
        config: ConfigPath,
    },
}

#[derive(Debug, Subcommand)]
enum EtcdCommand {
    /// Take a snapshot on every etcd host
    SnapshotSave {
        #[command(flatten)]
        config: ConfigPath,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        s3: S3Flags,
    },
    /// Restore etcd from a snapshot and converge the cluster
    SnapshotRestore {
        #[command(flatten)]
        config: ConfigPath,
        #[arg(long)]
        name: String,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
        #[command(flatten)]
        s3: S3Flags,
    },
    /// List snapshots on the etcd hosts
    SnapshotList {
        #[command(flatten)]
        config: ConfigPath,
    },
    /// Delete a snapshot from every etcd host
    SnapshotRemove {
        #[command(flatten)]
        config: ConfigPath,
        #[arg(long)]
        name: String,
        #[command(flatten)]
        s3: S3Flags,
    },
}

#[derive(Debug, Subcommand)]
enum CertCommand {
    /// Re-issue certificates and restart their consumers
    Rotate {
        #[command(flatten)]
        config: ConfigPath,
        /// Service whose certificates are rotated; all when omitted
        #[arg(long = "service")]
        services: Vec<String>,
        /// Replace the CA and every certificate
        #[arg(long)]
        rotate_ca: bool,
    },
}

fn init_logging(cli: &Cli) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// SSH options from the cluster file; an unreadable file falls back to
/// defaults and is reported by the engine
fn dialer(config: &Path, runtime: &RuntimeConfig) -> SshDialer {
    let mut options = SshOptions {
        passphrase: runtime.ssh_passphrase.clone(),
        ..SshOptions::default()
    };
    if let Ok(spec) = engine::load_cluster_file(config) {
        options.default_key_path = spec.ssh_key_path;
        options.ignore_docker_version = spec.ignore_docker_version;
    }
    SshDialer::new(options)
}

fn build_engine(config: &Path, runtime: RuntimeConfig, cancel: CancellationToken) -> Engine {
    Engine::new(
        Arc::new(dialer(config, &runtime)),
        Arc::new(LiveConnectors::new(PROBE_TIMEOUT)),
        runtime,
        cancel,
    )
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn prompt(question: &str, default: &str) -> Result<String> {
    print!("{question} [{default}]: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    let answer = answer.trim();
    Ok(if answer.is_empty() { default.to_string() } else { answer.to_string() })
}

/// Ask for hosts one at a time until an empty address
fn prompt_nodes() -> Result<Vec<cluster_types::NodeConfig>> {
    let mut nodes = Vec::new();
    loop {
        let address = prompt(&format!("SSH address of host {}, empty to finish", nodes.len() + 1), "")?;
        if address.is_empty() {
            break;
        }
        let user = prompt("SSH user", "ubuntu")?;
        let roles = prompt("Roles, comma separated", "controlplane,etcd,worker")?;
        let role = roles
            .split(',')
            .map(|r| serde_yaml::from_str(r.trim()).with_context(|| format!("unknown role {r}")))
            .collect::<Result<Vec<_>>>()?;
        nodes.push(cluster_types::NodeConfig {
            address,
            user,
            role,
            ..Default::default()
        });
    }
    Ok(nodes)
}

async fn generate_config(print: bool, name: &Path, provider: Option<&str>, input: Option<&str>) -> Result<()> {
    let nodes = match (provider, input) {
        (Some(provider), Some(input)) => {
            let mut registry = ProviderRegistry::builtin();
            let source = registry.get(provider).await?;
            let names = source.nodes_from_config(input).await?;
            info!("Provider {} found {} node(s)", provider, names.len());
            source.read_node_configurations(&names).await?
        }
        _ => prompt_nodes()?,
    };
    let spec = ClusterSpec {
        nodes,
        ..ClusterSpec::default()
    };
    cluster_types::validate(&spec).context("generated cluster file is invalid")?;
    let yaml = serde_yaml::to_string(&spec)?;
    if print {
        println!("{yaml}");
    } else {
        std::fs::write(name, yaml).with_context(|| format!("failed to write {}", name.display()))?;
        info!("Wrote cluster file {}", name.display());
    }
    Ok(())
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<Option<RunSummary>> {
    let runtime = RuntimeConfig::from_env()?;
    match cli.command {
        Command::Up {
            config,
            update_only,
            disable_port_check,
        } => {
            let options = RunOptions {
                update_only,
                skip_port_check: disable_port_check,
            };
            let summary = build_engine(&config.path, runtime, cancel).up(&config.path, options).await?;
            Ok(Some(summary))
        }
        Command::Remove { config, force } => {
            if !force && !confirm(&format!("Remove the cluster of {}?", config.path.display()))? {
                bail!(EngineError::Aborted("removal not confirmed".to_string()));
            }
            let summary = build_engine(&config.path, runtime, cancel).remove(&config.path).await?;
            Ok(Some(summary))
        }
        Command::Etcd { command } => match command {
            EtcdCommand::SnapshotSave { config, name, s3 } => {
                let name = name.unwrap_or_else(|| default_snapshot_name(chrono::Utc::now()));
                let saved = build_engine(&config.path, runtime, cancel)
                    .snapshot_save(&config.path, &name, s3.backup_config()?)
                    .await?;
                info!("Snapshot {} saved on {}", name, saved.join(", "));
                Ok(None)
            }
            EtcdCommand::SnapshotRestore { config, name, yes, s3 } => {
                if !yes && !confirm(&format!("Restore etcd from snapshot {name}? Data written since is lost"))? {
                    bail!(EngineError::Aborted("restore not confirmed".to_string()));
                }
                let summary = build_engine(&config.path, runtime, cancel)
                    .snapshot_restore(&config.path, &name, s3.backup_config()?)
                    .await?;
                Ok(Some(summary))
            }
            EtcdCommand::SnapshotList { config } => {
                let listings = build_engine(&config.path, runtime, cancel).snapshot_list(&config.path).await?;
                for listing in listings {
                    println!("{}\t{}\t{}", listing.file.name, listing.file.size, listing.hosts.join(","));
                }
                Ok(None)
            }
            EtcdCommand::SnapshotRemove { config, name, s3 } => {
                build_engine(&config.path, runtime, cancel)
                    .snapshot_remove(&config.path, &name, s3.backup_config()?)
                    .await?;
                info!("Snapshot {} removed", name);
                Ok(None)
            }
        },
        Command::Cert {
            command:
                CertCommand::Rotate {
                    config,
                    services,
                    rotate_ca,
                },
        } => {
            let summary = build_engine(&config.path, runtime, cancel)
                .rotate_certificates(&config.path, services, rotate_ca)
                .await?;
            Ok(Some(summary))
        }
        Command::Config {
            print,
            name,
            schema,
            provider,
            input,
            system_images,
            list_version,
            all,
            version,
        } => {
            let catalog = Catalog::builtin();
            if schema {
                println!("{}", serde_json::to_string_pretty(&schemars::schema_for!(ClusterSpec))?);
            } else if list_version && all {
                catalog.versions().for_each(|v| println!("{v}"));
            } else if list_version {
                println!("{DEFAULT_KUBERNETES_VERSION}");
            } else if system_images {
                let version = version.as_deref().unwrap_or(DEFAULT_KUBERNETES_VERSION);
                info!("Generating images list for version [{}]", version);
                catalog.system_images(version)?.iter().for_each(|i| println!("{i}"));
            } else {
                generate_config(print, &name, provider.as_deref(), input.as_deref()).await?;
            }
            Ok(None)
        }
        Command::Version { config } => {
            println!("rke version {}", env!("CARGO_PKG_VERSION"));
            match build_engine(&config.path, runtime, cancel).cluster_version(&config.path).await {
                Ok(Some(version)) => println!("Server version: {version}"),
                Ok(None) => {}
                Err(e) => warn!("Cannot read the cluster version: {}", e),
            }
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    // Configure rustls crypto provider (ring) for the etcd and API clients
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            on_signal.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(Some(summary)) => {
            summary.log();
            let code = summary.exit_code();
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e.downcast_ref::<EngineError>().map_or(1, EngineError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
