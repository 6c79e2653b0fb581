use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use quilt_netd::daemon::{open_stores, shutdown_signal, system_state, Daemon, DaemonSettings};
use quilt_netd::icc::dns::forkdns::Forwarder;
use quilt_netd::icc::network::validate::{validate_config, validate_name};
use quilt_netd::icc::network::{ClientType, ForwardRequest, NetworkConfig, NetworkManager, NetworkPut};
use quilt_netd::sync::network::ForwardPort;
use quilt_netd::utils::Logger;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Managed bridge networking daemon", long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    #[clap(flatten)]
    settings: SettingsArgs,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SettingsArgs {
    #[clap(long, env = "QUILT_VAR_DIR", default_value = "/var/lib/quilt-netd", global = true)]
    var_dir: PathBuf,

    #[clap(long, env = "QUILT_LOG_DIR", default_value = "/var/log/quilt-netd", global = true)]
    log_dir: PathBuf,

    /// Defaults to networks.db under the var dir
    #[clap(long, env = "QUILT_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    #[clap(long, env = "QUILT_DNS_LISTEN", default_value = "0.0.0.0:8853", global = true)]
    dns_listen: SocketAddr,

    #[clap(long, env = "QUILT_UNPRIV_USER", global = true)]
    unpriv_user: Option<String>,

    #[clap(long, env = "QUILT_UNPRIV_GROUP", global = true)]
    unpriv_group: Option<String>,

    #[clap(long, env = "QUILT_SERVER_FINGERPRINT", default_value = "", global = true)]
    server_fingerprint: String,

    #[clap(long, env = "QUILT_CLUSTER_ADDRESS", global = true)]
    cluster_address: Option<String>,

    #[clap(long, env = "QUILT_MEMBER_NAME", default_value = "none", global = true)]
    member_name: String,

    #[clap(long, env = "QUILT_MEMBER_ID", default_value = "1", global = true)]
    member_id: i64,

    #[clap(long, env = "QUILT_APPARMOR", global = true)]
    apparmor: bool,

    /// Skip every host mutation
    #[clap(long, env = "QUILT_MOCK", global = true)]
    mock: bool,
}

impl SettingsArgs {
    fn daemon_settings(&self, heartbeat_file: Option<PathBuf>) -> DaemonSettings {
        let mut settings = DaemonSettings::new(&self.var_dir, &self.log_dir);
        if let Some(db_path) = &self.db_path {
            settings.db_path = db_path.clone();
        }
        settings.dns_listen = self.dns_listen;
        settings.unpriv_user = self.unpriv_user.clone();
        settings.unpriv_group = self.unpriv_group.clone();
        settings.server_fingerprint = self.server_fingerprint.clone();
        settings.cluster_address = self.cluster_address.clone();
        settings.member_name = self.member_name.clone();
        settings.member_id = self.member_id;
        settings.apparmor = self.apparmor;
        settings.mock_mode = self.mock;
        settings.heartbeat_file = heartbeat_file;
        settings
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every stored network and serve until signalled
    Daemon {
        #[clap(long, env = "QUILT_HEARTBEAT_FILE", help = "Cluster heartbeat JSON to poll for forkdns peers")]
        heartbeat_file: Option<PathBuf>,
    },

    /// Run the cluster DNS forwarder for a fan bridge
    Forkdns {
        #[clap(help = "Address and port to listen on")]
        listen: SocketAddr,
        #[clap(help = "DNS domain served by the bridge")]
        domain: String,
        #[clap(help = "File listing the forwarders of the other members")]
        servers: PathBuf,
    },

    #[clap(subcommand)]
    Network(NetworkCommands),

    #[clap(subcommand)]
    Forward(ForwardCommands),

    /// Check a bridge config without touching the host
    Validate {
        name: String,
        #[clap(value_parser = parse_key_val, help = "Config in KEY=VALUE format")]
        config: Vec<(String, String)>,
    },
}

#[derive(Subcommand, Debug)]
enum NetworkCommands {
    Create {
        name: String,
        #[clap(long, default_value = "default")]
        project: String,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(value_parser = parse_key_val, help = "Config in KEY=VALUE format")]
        config: Vec<(String, String)>,
    },
    Start {
        name: String,
        #[clap(long, default_value = "default")]
        project: String,
    },
    Stop {
        name: String,
        #[clap(long, default_value = "default")]
        project: String,
    },
    /// Replace the description and config of a network
    Update {
        name: String,
        #[clap(long, default_value = "default")]
        project: String,
        #[clap(long, default_value = "")]
        description: String,
        #[clap(value_parser = parse_key_val, help = "Config in KEY=VALUE format")]
        config: Vec<(String, String)>,
    },
    Delete {
        name: String,
        #[clap(long, default_value = "default")]
        project: String,
    },
    Rename {
        name: String,
        new_name: String,
        #[clap(long, default_value = "default")]
        project: String,
    },
    Show {
        name: String,
        #[clap(long, default_value = "default")]
        project: String,
    },
    List {
        #[clap(long, help = "Only list networks of this project")]
        project: Option<String>,
    },
    Leases {
        name: String,
        #[clap(long, default_value = "default")]
        project: String,
        #[clap(long, help = "Project whose leases to show, defaults to the network's")]
        for_project: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ForwardCommands {
    Create {
        network: String,
        listen_address: String,
        #[clap(long, default_value = "default")]
        project: String,
        #[clap(flatten)]
        body: ForwardBody,
    },
    /// Replace a forward's description, target and ports
    Update {
        network: String,
        listen_address: String,
        #[clap(long, default_value = "default")]
        project: String,
        #[clap(flatten)]
        body: ForwardBody,
    },
    Delete {
        network: String,
        listen_address: String,
        #[clap(long, default_value = "default")]
        project: String,
    },
    List {
        network: String,
        #[clap(long, default_value = "default")]
        project: String,
    },
}

#[derive(Args, Debug)]
struct ForwardBody {
    #[clap(long, default_value = "")]
    description: String,

    #[clap(long, help = "Default target for every port")]
    target_address: Option<String>,

    #[arg(long = "port", action = clap::ArgAction::Append, value_parser = parse_port,
          help = "PROTOCOL/LISTEN_PORTS/TARGET_ADDRESS[/TARGET_PORTS], e.g. tcp/80,8000-8010/10.0.0.2")]
    ports: Vec<ForwardPort>,
}

impl ForwardBody {
    fn into_request(self, listen_address: String) -> ForwardRequest {
        let mut config = BTreeMap::new();
        if let Some(target) = self.target_address {
            config.insert("target_address".to_string(), target);
        }
        ForwardRequest {
            listen_address,
            description: self.description,
            config,
            ports: self.ports,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("invalid KEY=VALUE: no `=` found in `{}`", s),
    }
}

fn parse_port(s: &str) -> Result<ForwardPort> {
    let fields: Vec<&str> = s.split('/').collect();
    if !(3..=4).contains(&fields.len()) || fields.iter().any(|f| f.is_empty()) {
        bail!("invalid port spec `{}`", s);
    }
    Ok(ForwardPort {
        description: String::new(),
        protocol: fields[0].to_string(),
        listen_port: fields[1].to_string(),
        target_address: fields[2].to_string(),
        target_port: fields.get(3).map(|p| p.to_string()).unwrap_or_default(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn manager(settings: &DaemonSettings) -> Result<NetworkManager> {
    let stores = open_stores(&settings.db_path).await?;
    let state = system_state(settings, stores.networks)?;
    Ok(NetworkManager::new(state))
}

async fn run_network(settings: &DaemonSettings, command: NetworkCommands) -> Result<()> {
    let manager = manager(settings).await?;

    match command {
        NetworkCommands::Create {
            name,
            project,
            description,
            config,
        } => {
            let record = manager
                .create(&project, &name, &description, config.into_iter().collect())
                .await
                .with_context(|| format!("Failed creating network {}", name))?;
            print_json(&record)?;
        }
        NetworkCommands::Start { name, project } => {
            manager.start(&project, &name).await?;
        }
        NetworkCommands::Stop { name, project } => {
            manager.stop(&project, &name).await?;
        }
        NetworkCommands::Update {
            name,
            project,
            description,
            config,
        } => {
            let put = NetworkPut {
                description,
                config: config.into_iter().collect(),
            };
            manager.update(&project, &name, put, ClientType::Normal).await?;
        }
        NetworkCommands::Delete { name, project } => {
            manager.delete(&project, &name, ClientType::Normal).await?;
        }
        NetworkCommands::Rename {
            name,
            new_name,
            project,
        } => {
            manager.rename(&project, &name, &new_name).await?;
        }
        NetworkCommands::Show { name, project } => {
            print_json(&manager.show(&project, &name).await?)?;
        }
        NetworkCommands::List { project } => {
            print_json(&manager.list(project.as_deref()).await?)?;
        }
        NetworkCommands::Leases {
            name,
            project,
            for_project,
        } => {
            let for_project = for_project.unwrap_or_else(|| project.clone());
            let leases = manager
                .leases(&project, &name, &for_project, ClientType::Normal)
                .await?;
            print_json(&leases)?;
        }
    }
    Ok(())
}

async fn run_forward(settings: &DaemonSettings, command: ForwardCommands) -> Result<()> {
    let manager = manager(settings).await?;

    match command {
        ForwardCommands::Create {
            network,
            listen_address,
            project,
            body,
        } => {
            manager
                .forward_create(&project, &network, body.into_request(listen_address))
                .await?;
        }
        ForwardCommands::Update {
            network,
            listen_address,
            project,
            body,
        } => {
            let request = body.into_request(listen_address.clone());
            manager
                .forward_update(&project, &network, &listen_address, request)
                .await?;
        }
        ForwardCommands::Delete {
            network,
            listen_address,
            project,
        } => {
            manager.forward_delete(&project, &network, &listen_address).await?;
        }
        ForwardCommands::List { network, project } => {
            print_json(&manager.forward_list(&project, &network).await?)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    Logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon { heartbeat_file } => {
            let settings = cli.settings.daemon_settings(heartbeat_file);
            let stores = open_stores(&settings.db_path).await?;
            let zones = stores.zones.clone();
            let state = system_state(&settings, stores.networks.clone())
                .context("Failed preparing network state")?;

            let daemon = Daemon::new(settings, Arc::new(NetworkManager::new(state)), zones);
            daemon.run(shutdown_signal()).await?;
            stores.connection.close().await;
        }
        Commands::Forkdns { listen, domain, servers } => {
            Forwarder::new(listen, domain, servers).run().await?;
        }
        Commands::Network(command) => {
            run_network(&cli.settings.daemon_settings(None), command).await?;
        }
        Commands::Forward(command) => {
            run_forward(&cli.settings.daemon_settings(None), command).await?;
        }
        Commands::Validate { name, config } => {
            validate_name(&name)?;
            let config = NetworkConfig::from(config.into_iter().collect::<BTreeMap<_, _>>());
            validate_config(&name, &config, &[], None)?;
            println!("Config for {} is valid", name);
        }
    }

    Ok(())
}
