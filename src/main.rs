//! parley-admin: inspect and maintain a parley store from the command line.
//!
//! Run it while the messenger itself is stopped. Opening the store resets
//! session handles and presence, and fails transfers left unfinished, exactly
//! as a messenger restart would.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use parley::config::{default_data_dir, load_settings};
use parley::logging;
use parley::messenger::Messenger;
use parley::model::PublicKey;
use parley::network::OfflineNetwork;
use parley::storage::{DbKey, OpenOptions, Storage};

const DB_KEY_ENV: &str = "PARLEY_DB_KEY";

/// Inspect and maintain a parley message store.
#[derive(Parser, Debug)]
#[command(name = "parley-admin", version, about)]
struct Cli {
    /// Data directory holding parley.db and config.toml [env: PARLEY_HOME] [default: ~/.parley]
    #[arg(long, short = 'd')]
    data_dir: Option<PathBuf>,

    /// Raw 32-byte database key as hex [env: PARLEY_DB_KEY]
    #[arg(long)]
    key_hex: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations and list the ledger
    Migrate,
    /// List contacts, favourites first
    Contacts,
    /// List received friend requests
    Requests,
    /// Show conversation history with a contact, oldest first
    History {
        /// Contact public key (64 hex characters)
        public_key: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Search message content
    Search {
        query: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List recent file transfers
    Transfers {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show the effective settings
    Settings,
    /// Change the largest file accepted for transfer
    SetMaxFileSize { bytes: u64 },
}

#[derive(Serialize)]
struct LedgerEntry {
    name: String,
    applied_at: u64,
}

fn main() {
    logging::init();
    if let Err(error) = run(Cli::parse()) {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let key = cli
        .key_hex
        .or_else(|| std::env::var(DB_KEY_ENV).ok())
        .map(|hex_key| DbKey::from_hex(&hex_key))
        .transpose()?;
    let settings = load_settings(&data_dir)?;

    if let Command::Migrate = cli.command {
        // Opening runs every pending migration.
        let storage = Storage::open_with(
            &settings.database_path(),
            OpenOptions {
                key,
                full_text: settings.full_text_mode(),
            },
        )?;
        let ledger: Vec<LedgerEntry> = storage
            .applied_migrations()?
            .into_iter()
            .map(|(name, applied_at)| LedgerEntry { name, applied_at })
            .collect();
        print_json(&ledger)?;
        storage.close()?;
        return Ok(());
    }

    let messenger = Messenger::open(settings, key, Arc::new(OfflineNetwork))?;
    match cli.command {
        Command::Migrate => {}
        Command::Contacts => print_json(&messenger.contacts().get_all_contacts())?,
        Command::Requests => print_json(&messenger.contacts().list_friend_requests()?)?,
        Command::History {
            public_key,
            limit,
            offset,
        } => {
            let public_key = PublicKey::from_hex(&public_key)?;
            let history = messenger
                .messages()
                .get_messages_for_contact(&public_key, limit, offset)?;
            print_json(&history)?;
        }
        Command::Search { query, limit } => {
            print_json(&messenger.messages().search_messages(&query, limit)?)?
        }
        Command::Transfers { limit } => {
            print_json(&messenger.transfers().list_transfers(limit)?)?
        }
        Command::Settings => {
            let settings = messenger.settings();
            print_json(&serde_json::json!({
                "data_dir": settings.data_dir,
                "database": settings.database_path(),
                "downloads": settings.downloads_dir(),
                "network_timeout_secs": settings.network_timeout_secs,
                "full_text_search": messenger.storage().has_full_text_search(),
                "max_file_size": messenger.transfers().get_max_file_size(),
                "encrypted": messenger.storage().is_encrypted(),
            }))?;
        }
        Command::SetMaxFileSize { bytes } => messenger.transfers().set_max_file_size(bytes)?,
    }
    messenger.close()?;
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
