//! Replidoc CLI - Interactive node shell
//!
//! Usage:
//!   replidoc --data-dir ./node-a --listen 127.0.0.1:7400
//!   replidoc --config node-b.json --destination <node-id>@127.0.0.1:7400

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use replidoc_core::network::TcpTransport;
use replidoc_core::{Destination, Node, NodeConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod commands;
mod ui;

use commands::CommandHandler;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node name shown in the prompt
    #[arg(short, long)]
    name: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Replication listen address (e.g., 127.0.0.1:7400, port 0 for random)
    #[arg(short, long)]
    listen: Option<String>,

    /// Initial destination as <node-id>@<address>; may be repeated
    #[arg(long = "destination")]
    destinations: Vec<Destination>,

    /// Write the effective config to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<(NodeConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if !self.destinations.is_empty() {
            config.destinations = self.destinations;
        }
        config.validate()?;
        Ok((config, self.write_config))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("replidoc_core=info")),
        )
        .init();

    let (config, write_config) = Args::parse().into_config()?;
    if let Some(path) = write_config {
        config.save(&path)?;
        ui::print_success(&format!("Config written to {}", path.display()));
        return Ok(());
    }

    // Print banner with version
    println!("{}", "=".repeat(60).bright_blue());
    println!("{}", format!("  {}", replidoc_core::version::version_string()).bright_cyan().bold());
    println!("{}", "  Multi-master document store".bright_white());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    info!("Opening node with config: {:?}", config);
    let listen_addr = config.listen_addr.clone();
    let node = Arc::new(Node::open(config, Arc::new(TcpTransport::new()))?);
    let bound = node.serve(&listen_addr).await?;
    node.start()?;

    println!("{} {}", "Node:".bright_green(), node.config().name);
    println!("{} {}", "Node ID:".bright_green(), node.node_id());
    println!("{} {}", "Listening:".bright_green(), bound);
    println!("{} {}", "Data:".bright_green(), node.config().data_dir.display());
    println!();

    let mut handler = CommandHandler::new(Arc::clone(&node), bound);

    // Interactive REPL
    let mut rl = DefaultEditor::new()?;
    let history_file = node.config().data_dir.join("history");
    let _ = rl.load_history(&history_file);

    println!("{}", "Type 'help' for available commands, 'quit' to exit".bright_yellow());
    println!();

    loop {
        let prompt = format!("{}> ", node.config().name.bright_cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match line {
                    "quit" | "exit" => {
                        println!("{}", "Goodbye!".bright_green());
                        break;
                    }
                    "help" => {
                        ui::print_help();
                    }
                    _ => {
                        if let Err(e) = handler.handle_command(line).await {
                            ui::print_error(&format!("{}", e));
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".yellow());
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("{}", "Goodbye!".bright_green());
                break;
            }
            Err(err) => {
                ui::print_error(&format!("Error: {}", err));
                break;
            }
        }
    }

    // Save history
    let _ = rl.save_history(&history_file);

    node.shutdown().await;

    Ok(())
}
