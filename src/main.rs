// ring-node/src/main.rs
use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use ringnode::config::{ConfigOverrides, NodeConfig};
use ringnode::discovery::Discovery;
use ringnode::id::Identifier;
use ringnode::node::{Peer, PeerSettings};
use ringnode::store_client::{StoreClient, StoreSettings};

#[derive(Parser)]
#[command(name = "ring-node")]
#[command(version, about = "Prefix-routing overlay node with a file store on top")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Run the rendezvous service
    Discovery {
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run an overlay peer
    Peer {
        /// Identifier as 4 hex digits (random if omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Rendezvous address as host:port
        #[arg(short, long)]
        discovery: Option<String>,

        #[arg(long)]
        storage_root: Option<String>,
    },

    /// Run the file-store client
    Store {
        #[arg(short, long)]
        discovery: Option<String>,

        #[arg(short, long)]
        workdir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { output } = &cli.command {
        return init_config(output.clone());
    }

    let mut config = NodeConfig::load_or_create()?;
    let overrides = match &cli.command {
        Commands::Discovery { port } => ConfigOverrides {
            // The rendezvous listens where peers expect to find it.
            discovery: port.map(|port| format!("{}:{}", config.discovery_host, port)),
            ..Default::default()
        },
        Commands::Peer {
            port,
            discovery,
            storage_root,
            ..
        } => ConfigOverrides {
            discovery: discovery.clone(),
            port: *port,
            storage_root: storage_root.clone(),
            ..Default::default()
        },
        Commands::Store { discovery, workdir } => ConfigOverrides {
            discovery: discovery.clone(),
            workdir: workdir.clone(),
            ..Default::default()
        },
        Commands::Init { .. } => ConfigOverrides::default(),
    };
    config.apply(overrides)?;
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    match cli.command {
        Commands::Discovery { .. } => run_discovery(config).await,
        Commands::Peer { id, .. } => run_peer(config, id).await,
        Commands::Store { .. } => run_store(config).await,
        Commands::Init { .. } => Ok(()),
    }
}

fn init_config(output: Option<String>) -> Result<()> {
    let config = NodeConfig::generate();
    let path = match output {
        Some(path) => std::path::PathBuf::from(path),
        None => NodeConfig::config_path()?,
    };
    config.save_to(&path)?;

    println!("✓ Configuration written to {}", path.display());
    println!();
    println!("Discovery: {}", config.discovery_address());
    println!("Storage root: {}", config.storage_root);
    println!();
    println!("Start the rendezvous, then peers:");
    println!("  ring-node discovery");
    println!("  ring-node peer");
    Ok(())
}

fn print_help(commands: &[(&str, &str)]) {
    for (name, what) in commands {
        println!("  {:<12} : {}", name, what);
    }
}

async fn run_discovery(config: NodeConfig) -> Result<()> {
    let address = format!("{}:{}", config.discovery_host, config.discovery_port);
    let discovery = Discovery::bind(&address, config.connect_timeout()).await?;

    println!("Input a command or use 'help' to print a list of commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.split_whitespace().next().unwrap_or("").to_lowercase();
        match command.as_str() {
            "" => {}
            "p" | "peers" => println!("{}", discovery.describe_peers().await),
            "h" | "help" => print_help(&[
                ("p[eers]", "print a list of peers constituting the network"),
                ("h[elp]", "print a list of valid commands"),
            ]),
            _ => tracing::error!("Invalid command. Use 'help' for help."),
        }
    }
    discovery.shutdown();
    Ok(())
}

async fn run_peer(config: NodeConfig, id: Option<String>) -> Result<()> {
    let id = id.map(|id| id.parse::<Identifier>()).transpose()?;
    let peer = Peer::bind(id, PeerSettings::from_config(&config)).await?;

    if !peer.register().await {
        peer.shutdown().await;
        anyhow::bail!("Cannot reach discovery at {}", config.discovery_address());
    }

    println!("Enter a command or use 'help' to print a list of commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = line.split_whitespace().next().unwrap_or("").to_lowercase();
        match command.as_str() {
            "" => {}
            "r" | "routing" => println!("{}", peer.routing().describe()),
            "f" | "files" => println!("{}", peer.describe_files()),
            "l" | "leave" => break,
            "h" | "help" => print_help(&[
                ("r[outing]", "print routing table and leaf set for this node"),
                ("f[iles]", "print the list of files stored at this node"),
                ("l[eave]", "leave the network"),
                ("h[elp]", "print a list of valid commands"),
            ]),
            _ => tracing::error!("Invalid command. Use 'help' for help."),
        }
    }

    peer.leave().await;
    Ok(())
}

async fn run_store(config: NodeConfig) -> Result<()> {
    let client = StoreClient::bind(StoreSettings::from_config(&config)).await?;

    println!("Enter a command or use 'help' to print a list of commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or("").to_lowercase();
        let argument = words.next();
        match (command.as_str(), argument) {
            ("", _) => {}
            ("s" | "store", Some(path)) => {
                client.store(path).await;
            }
            ("r" | "retrieve", Some(name)) => {
                client.retrieve(name).await;
            }
            ("d" | "delete", Some(name)) => {
                client.delete(name).await;
            }
            ("s" | "store" | "r" | "retrieve" | "d" | "delete", None) => {
                tracing::error!("You must provide a filename. Use 'help' for usage.");
            }
            ("f" | "files", _) => println!("{}", client.describe_files()),
            ("wd", Some(dir)) => {
                client.set_workdir(dir);
                println!("  {}", client.workdir().display());
            }
            ("wd", None) => println!("  {}", client.workdir().display()),
            ("e" | "exit", _) => break,
            ("h" | "help", _) => print_help(&[
                ("s[tore] p", "store the file at path p in the network"),
                ("r[etrieve] f", "retrieve file f into the reads directory"),
                ("d[elete] f", "delete file f from the network"),
                ("f[iles]", "print the files this client has stored"),
                ("wd [dir]", "print or change the working directory"),
                ("e[xit]", "exit"),
                ("h[elp]", "print a list of valid commands"),
            ]),
            _ => tracing::error!("Invalid command. Use 'help' for help."),
        }
    }

    client.shutdown().await;
    Ok(())
}
