//! classcast-cli - Command-line interface for the classcast gateway
//!
//! One-shot commands, a room listener and development credentials.

mod commands;

use clap::{Parser, Subcommand};
use classcast_client::{ConnectionConfig, RealtimeClient};
use classcast_protocol::{WireMode, DEFAULT_GATEWAY_PORT};
use colored::Colorize;
use std::net::{Ipv4Addr, SocketAddr};
use tracing_subscriber::EnvFilter;

fn default_server() -> String {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_GATEWAY_PORT)).to_string()
}

#[derive(Parser)]
#[command(name = "classcast-cli")]
#[command(about = "Command-line interface for the classcast real-time gateway")]
#[command(version)]
pub struct Cli {
    /// Gateway address
    #[arg(short, long, default_value_t = default_server())]
    server: String,

    /// Bearer credential
    #[arg(short = 't', long, env = "CLASSCAST_TOKEN")]
    token: Option<String>,

    /// Namespace to bind to
    #[arg(short, long, default_value = "/notifications")]
    namespace: String,

    /// Speak line-delimited JSON instead of binary frames
    #[arg(long)]
    jsonl: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Handshake and send one heartbeat
    Ping,

    /// Join rooms and print events until Ctrl+C
    Listen {
        /// Rooms to join, e.g. class:math-101
        rooms: Vec<String>,

        /// Only print events with this name
        #[arg(short, long)]
        event: Option<String>,
    },

    /// Send one command and print its ack
    Send {
        /// Command name
        command: String,

        /// Payload JSON (or @file.json to read from file)
        payload: Option<String>,
    },

    /// Mint a development credential
    MintToken {
        /// User id (token subject)
        #[arg(short, long)]
        user: String,

        /// Role: student, guardian, teacher, school_admin, district_admin, service
        #[arg(short, long, default_value = "student")]
        role: String,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        district: Option<String>,

        #[arg(long)]
        school: Option<String>,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,

        /// Signing secret
        #[arg(long, env = "CLASSCAST_JWT_SECRET", hide_env_values = true)]
        secret: String,

        #[arg(long, env = "CLASSCAST_JWT_ISSUER")]
        issuer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::MintToken { .. } = cli.command {
        match commands::mint_token(cli.command) {
            Ok(token) => println!("{}", token),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let Some(token) = cli.token.clone() else {
        eprintln!(
            "{}: a token is required (--token or CLASSCAST_TOKEN)",
            "Error".red()
        );
        std::process::exit(1);
    };

    let addr: SocketAddr = cli.server.parse()?;
    let mut config =
        ConnectionConfig::new(addr, token, &cli.namespace).with_client_name("classcast-cli");
    if cli.jsonl {
        config = config.with_wire_mode(WireMode::Jsonl);
    }
    let client = RealtimeClient::new(config);

    let info = client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    tracing::debug!("Connected as {} ({})", info.user_id, info.role);

    let result = match cli.command {
        Commands::Listen { rooms, event } => commands::listen(&client, &rooms, event).await,
        cmd => commands::execute(&client, &info, cmd).await,
    };

    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            let _ = client.close().await;
            std::process::exit(1);
        }
    }

    client.close().await?;
    Ok(())
}
