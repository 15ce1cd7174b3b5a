//! Castkeeper CLI
//!
//! Command-line interface for operating a running castkeeper daemon.
//!
//! # Usage
//!
//! ```bash
//! # Start connecting a platform and print the URL to visit
//! castkeeper connect youtube
//!
//! # Finish the connection with the code the provider redirected back with
//! castkeeper complete creator-42 youtube <code> --state <state>
//!
//! # Get a valid access token
//! castkeeper token creator-42 youtube
//!
//! # Run a health check now
//! castkeeper health-check
//! ```

use anyhow::Result;
use castkeeper_cli::client::{DaemonClient, default_socket_path};
use castkeeper_cli::RpcError;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "castkeeper")]
#[command(about = "Keep podcast creators' platform connections alive")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Daemon socket (defaults to the per-user runtime directory)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Get a valid access token, refreshing it if needed
    Token {
        /// User identifier
        user: String,

        /// Platform (youtube, instagram, tiktok, spotify, linkedin, twitter)
        platform: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Load a user's stored tokens into the daemon's cache
    Warm {
        user: String,
    },

    /// Print the URL a user visits to connect a platform
    Connect {
        platform: String,
    },

    /// Exchange the authorization code returned by the provider
    Complete {
        user: String,
        platform: String,
        code: String,

        /// The state value returned together with the authorization URL
        #[arg(short, long)]
        state: Option<String>,
    },

    /// Remove a user's connection to a platform
    Disconnect {
        user: String,
        platform: String,
    },

    /// Run a health-check sweep now
    HealthCheck,

    /// List credentials that expire soon
    Expiring {
        /// Look-ahead window in days
        #[arg(short, long, default_value_t = 7)]
        days: i64,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show a user's recent notifications
    Notifications {
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        FmtSubscriber::builder()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    }

    let socket_path = cli.socket.unwrap_or_else(default_socket_path);
    let mut client = DaemonClient::connect(&socket_path).await?;

    let result = run(&mut client, cli.command).await;
    if let Some(rpc) = result
        .as_ref()
        .err()
        .and_then(|e| e.downcast_ref::<RpcError>())
        .filter(|rpc| rpc.requires_user_action())
    {
        eprintln!("The user has to (re)connect this platform: {}", rpc.message);
    }
    result
}

async fn run(client: &mut DaemonClient, command: Commands) -> Result<()> {
    match command {
        Commands::Token {
            user,
            platform,
            format,
        } => {
            let token = client.get_token(&user, &platform).await?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&token)?),
                Format::Text => println!("{}", token.token),
            }
        }
        Commands::Warm { user } => {
            let report = client.init_user_tokens(&user).await?;
            println!(
                "Loaded {} token(s) for {} ({} failed)",
                report.loaded, report.user, report.failed
            );
        }
        Commands::Connect { platform } => {
            let auth = client.authorization_url(&platform).await?;
            println!("Open this URL to connect {}:", platform);
            println!("  {}", auth.url);
            println!("State: {}", auth.state);
        }
        Commands::Complete {
            user,
            platform,
            code,
            state,
        } => {
            let response = client
                .complete_connection(&user, &platform, &code, state.as_deref())
                .await?;
            println!("{}", response.message);
            if let Some(expires_at) = response.expires_at {
                println!("  Token expires at {}", expires_at);
            }
        }
        Commands::Disconnect { user, platform } => {
            let response = client.disconnect(&user, &platform).await?;
            println!("{}", response.message);
        }
        Commands::HealthCheck => {
            let response = client.run_health_check().await?;
            if !response.success {
                anyhow::bail!("Health check not started: {}", response.message);
            }
            println!("{}", response.message);
            if let Some(report) = response.report {
                println!("  Skipped: {}", report.skipped);
            }
        }
        Commands::Expiring { days, format } => {
            let response = client.list_expiring(days).await?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&response)?),
                Format::Text if response.credentials.is_empty() => {
                    println!("No credentials expire within {} days", days);
                }
                Format::Text => {
                    for credential in response.credentials {
                        println!(
                            "{}/{}  expires {}  [{}]{}",
                            credential.user,
                            credential.platform,
                            credential.expires_at.as_deref().unwrap_or("unknown"),
                            credential.status,
                            if credential.has_refresh_token {
                                ""
                            } else {
                                "  (no refresh token)"
                            }
                        );
                    }
                }
            }
        }
        Commands::Notifications { user } => {
            let response = client.list_notifications(&user).await?;
            if response.notifications.is_empty() {
                println!("No notifications for {}", user);
            }
            for notification in response.notifications {
                println!(
                    "{}  {:?}  {}: {}",
                    notification.created_at.format("%Y-%m-%d %H:%M"),
                    notification.severity,
                    notification.platform.display_name(),
                    notification.message
                );
                if let (Some(label), Some(path)) =
                    (notification.action_label, notification.action_path)
                {
                    println!("    {} -> {}", label, path);
                }
            }
        }
    }

    Ok(())
}
