//! Webex CLI - messaging tools for the Webex API
//!
//! Every command prints one JSON document to stdout; logs go to stderr.
//! `serve` instead answers one JSON request per stdin line until EOF.

mod api;
mod auth;
mod config;
mod models;
mod tools;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::messages::NewMessage;
use api::rooms::RoomQuery;
use api::{ListRequest, WebexClient};
use auth::Auth;
use config::Settings;

#[derive(Parser)]
#[command(name = "webex-cli")]
#[command(about = "Command-line tools for Webex messaging", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain a new token for the configured auth mode
    Login {
        /// Run the interactive flow even if a valid token is stored
        #[arg(short, long)]
        force: bool,
    },

    /// Clear cached and stored tokens
    Logout,

    /// Show current authentication status
    Status,

    /// Show the authenticated user (verify auth works)
    Whoami,

    /// List rooms
    Rooms {
        /// Maximum number of rooms
        #[arg(short, long)]
        max: Option<usize>,

        /// Room type: direct or group
        #[arg(long = "type")]
        room_type: Option<String>,

        /// Sort order: id, lastactivity or created
        #[arg(long)]
        sort_by: Option<String>,
    },

    /// Show one room
    Room {
        room_id: String,
    },

    /// List a room's messages, newest first
    Messages {
        room_id: String,

        /// Only messages created at or after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(short, long)]
        after: Option<String>,

        /// Maximum number of messages
        #[arg(short, long)]
        max: Option<usize>,

        /// Only replies to this parent message
        #[arg(long)]
        parent: Option<String>,

        /// Only messages mentioning these people (`me` or person IDs, comma separated)
        #[arg(long)]
        mentioned: Option<String>,

        /// Only messages created before this time
        #[arg(long)]
        before: Option<String>,

        /// Only messages older than this message ID
        #[arg(long)]
        before_message: Option<String>,

        /// Print full message objects instead of summaries
        #[arg(long)]
        raw: bool,
    },

    /// Show one message
    Message {
        message_id: String,
    },

    /// Send a message
    Send {
        /// Room ID
        #[arg(short, long, conflicts_with = "email")]
        room: Option<String>,

        /// Recipient email for a direct message
        #[arg(short, long)]
        email: Option<String>,

        /// Reply in the thread of this message
        #[arg(long)]
        parent: Option<String>,

        /// Treat the text as markdown
        #[arg(long)]
        markdown: bool,

        /// Message content
        text: String,
    },

    /// Delete a message
    Delete {
        message_id: String,
    },

    /// Answer JSON tool calls from stdin, one per line, with a shared token
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout carries command output
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let settings = Settings::load().context("Failed to load configuration")?;

    // Auth commands manage the token themselves; don't fetch one up front
    let acquire = !matches!(
        cli.command,
        Commands::Login { .. } | Commands::Logout | Commands::Status
    );
    let auth = Arc::new(Auth::new());
    auth.initialize(&settings.auth, acquire)
        .await
        .context("Authentication setup failed")?;

    let client = WebexClient::new(settings.api_base.clone(), auth.clone());
    let result = run(cli.command, &client, &auth).await;
    auth.shutdown();

    if !result? {
        std::process::exit(1);
    }
    Ok(())
}

/// Run a command; `false` when it printed a tool error.
async fn run(command: Commands, client: &WebexClient, auth: &Auth) -> Result<bool> {
    let output = match command {
        Commands::Serve => {
            tracing::info!("Serving tool requests on stdin");
            let input = BufReader::new(tokio::io::stdin());
            tools::serve(client, auth, input, tokio::io::stdout()).await?;
            return Ok(true);
        }
        Commands::Login { force } => {
            tracing::info!("Starting authentication flow...");
            tools::login(auth, force).await
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            tools::logout(auth)
        }
        Commands::Status => tools::auth_status(auth),
        Commands::Whoami => tools::get_me(client).await,
        Commands::Rooms {
            max,
            room_type,
            sort_by,
        } => {
            let query = RoomQuery {
                max,
                room_type,
                sort_by,
            };
            tools::list_rooms(client, &query).await
        }
        Commands::Room { room_id } => tools::get_room(client, &room_id).await,
        Commands::Messages {
            room_id,
            after,
            max,
            parent,
            mentioned,
            before,
            before_message,
            raw,
        } => {
            let request = ListRequest {
                room_id,
                after,
                max,
                parent_id: parent,
                mentioned_people: mentioned,
                before,
                before_message,
            };
            tools::list_messages(client, &request, raw).await
        }
        Commands::Message { message_id } => tools::get_message(client, &message_id).await,
        Commands::Send {
            room,
            email,
            parent,
            markdown,
            text,
        } => {
            let (text, markdown) = if markdown {
                (None, Some(text))
            } else {
                (Some(text), None)
            };
            let message = NewMessage {
                room_id: room,
                to_person_email: email,
                text,
                markdown,
                parent_id: parent,
            };
            tools::create_message(client, &message).await
        }
        Commands::Delete { message_id } => tools::delete_message(client, &message_id).await,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(output.get("error").is_none())
}
