/*
    spotify-backup-rs | Rust CLI tool to back up Spotify playlists to JSON.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use backup_core::server::{self, AppState};
use backup_core::{
    interactive_login, resolve_access_token, Backup, BrowserLauncher, Settings, SystemBrowser,
    TokenSource, TokenStore,
};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use log::debug;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "spotify-backup")]
#[command(about = "Back up your Spotify playlists to local JSON files", long_about = None)]
struct Cli {
    /// File holding the refresh token between runs
    #[arg(long, global = true, env = "SPOTIFY_TOKEN_FILE", default_value = ".token")]
    token_file: PathBuf,

    /// Where `backup` writes playlists, images and the index
    #[arg(long, global = true, env = "OUT_DIR", default_value = "./backup")]
    out_dir: PathBuf,

    /// Port `serve` listens on
    #[arg(long, global = true, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Run the web server instead of a backup when no command is given
    #[arg(
        long,
        env = "WEB_MODE",
        hide = true,
        action = clap::ArgAction::Set,
        value_parser = parse_flag,
        default_value = "false"
    )]
    web_mode: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Downloads every playlist into the output directory (default command)
    Backup,
    /// Runs the browser authorization flow and stores the refresh token
    Auth,
    /// Serves the JSON API used by the web front end
    Serve,
}

fn parse_flag(value: &str) -> Result<bool, String> {
    Ok(matches!(value.trim(), "1" | "true"))
}

/// Opens the system browser and falls back to printing the URL.
struct TerminalBrowser;

impl BrowserLauncher for TerminalBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        println!("Opening browser for authentication...");
        let result = SystemBrowser.open(url);
        if result.is_err() {
            println!();
            println!("Couldn't open browser automatically. Please open this URL manually:");
            println!();
            println!("   {}", url);
            println!();
        }
        println!("Waiting for authorization...");
        result
    }
}

#[tokio::main]
async fn main() {
    if dotenv().is_err() {
        // Silently ignore
    }

    env_logger::init();

    let cli = Cli::parse();
    let store = TokenStore::new(&cli.token_file);
    let settings = Settings::from_env();
    debug!("Refresh token file: {}", store.path().display());

    match cli.command {
        Some(Commands::Auth) => handle_auth(&settings, &store).await,
        Some(Commands::Serve) => handle_serve(settings, store, cli.port).await,
        None if cli.web_mode => handle_serve(settings, store, cli.port).await,
        Some(Commands::Backup) | None => handle_backup(&settings, &store, &cli.out_dir).await,
    }
}

async fn handle_backup(settings: &Settings, store: &TokenStore, out_dir: &Path) {
    let grant = match resolve_access_token(settings, store, Arc::new(TerminalBrowser)).await {
        Ok(grant) => grant,
        Err(e) => {
            eprintln!("Authentication failed: {}", e);
            process::exit(1);
        }
    };

    match grant.source {
        TokenSource::Environment => {}
        TokenSource::RefreshToken { from_store } => {
            if from_store {
                println!("Loaded refresh token from {}", store.path().display());
            }
            println!("Got access token from refresh token");
        }
        TokenSource::Interactive {
            refresh_token_saved,
        } => report_saved(store, refresh_token_saved),
    }

    let backup = match Backup::new(&grant.access_token) {
        Ok(backup) => backup,
        Err(e) => {
            eprintln!("Error initializing backup client: {}", e);
            process::exit(1);
        }
    };

    println!("Backing up playlists into {} ...", out_dir.display());

    match backup.run(out_dir).await {
        Ok(summary) => {
            println!();
            println!("---------------------------------------------------");
            println!("BACKUP COMPLETE");
            println!("---------------------------------------------------");
            println!("Playlists Found:  {}", summary.playlists_found);
            println!("Playlists Saved:  {}", summary.saved());
            println!("Skipped:          {}", summary.skipped.len());
            println!("Missing Covers:   {}", summary.images_failed);
            println!("Output Dir:       {}", summary.out_dir.display());
            println!("---------------------------------------------------");

            if !summary.skipped.is_empty() {
                println!();
                println!("The following playlists were not saved:");
                for (i, skipped) in summary.skipped.iter().enumerate() {
                    println!("{}. {}", i + 1, skipped);
                }
            }
        }
        Err(e) => {
            eprintln!();
            eprintln!("Backup failed: {}", e);
            process::exit(1);
        }
    }
}

async fn handle_auth(settings: &Settings, store: &TokenStore) {
    println!("Starting Spotify authorization...");

    match interactive_login(settings, store, Arc::new(TerminalBrowser)).await {
        Ok((_, saved)) => {
            println!("✓ Authorization successful");
            report_saved(store, saved);
            if !saved {
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Interactive auth failed: {}", e);
            process::exit(1);
        }
    }
}

async fn handle_serve(settings: Settings, store: TokenStore, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = AppState::new(settings, store);

    println!("Starting web server on port {}...", port);
    if let Err(e) = server::serve(addr, state).await {
        eprintln!("Failed to start web server: {}", e);
        process::exit(1);
    }
}

fn report_saved(store: &TokenStore, saved: bool) {
    if saved {
        println!("✓ Refresh token saved to {}", store.path().display());
    } else {
        eprintln!(
            "warning: failed to save refresh token to {}",
            store.path().display()
        );
    }
}
