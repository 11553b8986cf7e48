//! Command execution.

use crate::Commands;
use classcast_client::{ConnectionStatus, HandshakeInfo, RealtimeClient};
use classcast_server::{Authenticator, Identity, Role, TenantPath};
use colored::Colorize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(
    client: &RealtimeClient,
    info: &HandshakeInfo,
    cmd: Commands,
) -> CliResult<String> {
    match cmd {
        Commands::Ping => {
            let started = Instant::now();
            client.heartbeat().await?;
            Ok(format!(
                "{} from {} as {} ({}) in {:?}",
                "PONG".green(),
                info.namespace.cyan(),
                info.user_id,
                info.role,
                started.elapsed()
            ))
        }

        Commands::Send { command, payload } => {
            let payload = match payload {
                Some(arg) => parse_json_arg(&arg)?,
                None => json!({}),
            };
            let ack = client.request(&command, payload).await?;
            let rendered = format_json(&serde_json::to_value(&ack)?);
            if ack.success {
                Ok(rendered)
            } else {
                Ok(format!("{}\n{}", "Rejected".red(), rendered))
            }
        }

        Commands::Listen { .. } | Commands::MintToken { .. } => unreachable!(),
    }
}

/// Joins `rooms` and prints events until Ctrl+C.
pub async fn listen(
    client: &RealtimeClient,
    rooms: &[String],
    filter: Option<String>,
) -> CliResult<String> {
    let mut events = client.subscribe_all();
    for room in rooms {
        let joined = client.join(room).await?;
        eprintln!("{} {}", "Joined".green(), room.cyan());
        if let Some(state) = joined.get("state").filter(|s| !is_empty_object(s)) {
            eprintln!("{}", format_json(state).dimmed());
        }
    }
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    let mut status = client.watch_status();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(e) => {
                        if filter.as_deref().is_some_and(|f| f != e.event) {
                            continue;
                        }
                        println!("{}", serde_json::to_string(&e)?);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        eprintln!("{}", "Connection closed".red());
                        break;
                    }
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                eprintln!("{} {:?}", "Status".dimmed(), current);
                if current == ConnectionStatus::Closed {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                break;
            }
        }
    }
    Ok(String::new())
}

/// Signs a credential with the gateway's secret.
pub fn mint_token(cmd: Commands) -> CliResult<String> {
    let Commands::MintToken {
        user,
        role,
        tenant,
        district,
        school,
        name,
        ttl,
        secret,
        issuer,
    } = cmd
    else {
        unreachable!()
    };

    let role = parse_role(&role)?;
    let mut path = TenantPath::new(tenant);
    if let Some(district) = district {
        path = path.with_district(district);
    }
    if let Some(school) = school {
        path = path.with_school(school);
    }
    let mut identity = Identity::new(user, role, path);
    if let Some(name) = name {
        identity = identity.with_display_name(name);
    }

    let authenticator = Authenticator::new(secret.as_bytes(), issuer, 0);
    Ok(authenticator.issue(&identity, Duration::from_secs(ttl))?)
}

fn parse_role(role: &str) -> CliResult<Role> {
    serde_json::from_value(Value::String(role.to_string()))
        .map_err(|_| format!("unknown role '{}'", role).into())
}

/// Parses JSON from argument (supports @file syntax).
fn parse_json_arg(arg: &str) -> CliResult<Value> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|o| o.is_empty())
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
