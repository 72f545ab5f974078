//! Command handler for CLI

use crate::ui;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use replidoc_core::{Body, Content, Destination, DocumentId, Lookup, Node, NodeId};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct CommandHandler {
    node: Arc<Node>,
    bound: SocketAddr,
}

impl CommandHandler {
    pub fn new(node: Arc<Node>, bound: SocketAddr) -> Self {
        Self { node, bound }
    }

    pub async fn handle_command(&mut self, input: &str) -> Result<()> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(());
        }

        match parts[0] {
            "whoami" => self.cmd_whoami(),
            "version" | "about" => self.cmd_version(),
            "get" => self.cmd_get(&parts[1..]),
            "put" => self.cmd_put(&parts[1..]),
            "delete" | "rm" => self.cmd_delete(&parts[1..]),
            "history" => self.cmd_history(&parts[1..]),
            "conflicts" => self.cmd_conflicts(),
            "candidate" => self.cmd_candidate(&parts[1..]),
            "resolve" => self.cmd_resolve(&parts[1..]),
            "destinations" | "dest" => self.cmd_destinations(&parts[1..]).await,
            "stats" => self.cmd_stats(),
            "gc" => self.cmd_gc().await,
            _ => {
                ui::print_error(&format!("Unknown command: {}", parts[0]));
                ui::print_info("Type 'help' for available commands");
                Ok(())
            }
        }
    }

    fn cmd_version(&self) -> Result<()> {
        println!();
        println!("{}", "=".repeat(60).bright_blue());
        println!("{}", format!("  {}", replidoc_core::version::version_string()).bright_cyan().bold());
        println!("{}", "=".repeat(60).bright_blue());
        println!();
        println!("{} {}", "Protocol Version:".bright_green(), replidoc_core::version::PROTOCOL_VERSION);
        println!("{} {}", "Build:".bright_green(), replidoc_core::version::BUILD_PROFILE);
        println!();
        Ok(())
    }

    fn cmd_whoami(&self) -> Result<()> {
        println!();
        println!("{} {}", "Name:".bright_green(), self.node.config().name.bright_cyan());
        println!("{} {}", "Node ID:".bright_green(), self.node.node_id());
        println!("{} {}", "Listening:".bright_green(), self.bound);
        println!(
            "{} {}@{}",
            "Add me with:".bright_green(),
            self.node.node_id(),
            self.bound
        );
        println!("{} {}", "Last sequence:".bright_green(), self.node.storage().last_sequence());
        println!();
        Ok(())
    }

    fn cmd_get(&self, args: &[&str]) -> Result<()> {
        let id = identity(args, "get <id>")?;
        match self.node.get(&id)? {
            Lookup::Found(doc) => ui::print_document(&doc),
            Lookup::Conflict(conflict) => {
                ui::print_warning(&conflict.to_string());
                for candidate in &conflict.candidates {
                    println!("  {}", candidate.as_str().bright_yellow());
                }
                ui::print_info("Inspect with 'candidate <candidate-id>', fix with 'resolve'");
            }
            Lookup::NotFound => ui::print_info(&format!("{} not found", id)),
        }
        Ok(())
    }

    fn cmd_put(&self, args: &[&str]) -> Result<()> {
        let (id, text) = identity_and_text(args, "put <id> <text>")?;
        let history = self.node.put(&id, Content::new(text))?;
        ui::print_success(&format!("Wrote {} ({:?})", id, history));
        Ok(())
    }

    fn cmd_delete(&self, args: &[&str]) -> Result<()> {
        let id = identity(args, "delete <id>")?;
        self.node.delete(&id)?;
        ui::print_success(&format!("Deleted {}", id));
        Ok(())
    }

    fn cmd_history(&self, args: &[&str]) -> Result<()> {
        let id = identity(args, "history <id>")?;
        match self.node.history(&id)? {
            Some(history) => ui::print_history(&history),
            None => ui::print_info(&format!("{} has no history", id)),
        }
        Ok(())
    }

    fn cmd_conflicts(&self) -> Result<()> {
        let conflicts = self.node.conflicts()?;
        println!();
        if conflicts.is_empty() {
            ui::print_info("No unresolved conflicts");
            return Ok(());
        }
        println!("{}", format!("Conflicts ({}):", conflicts.len()).bright_cyan().bold());
        for conflict in conflicts {
            println!("  {}", conflict.identity.to_string().bright_yellow());
            for candidate in &conflict.candidates {
                println!("    {}", candidate);
            }
        }
        println!();
        Ok(())
    }

    fn cmd_candidate(&self, args: &[&str]) -> Result<()> {
        let Some(raw) = args.first() else {
            bail!("Usage: candidate <candidate-id>");
        };
        let Some(version) = self.node.get_candidate(raw)? else {
            ui::print_info(&format!("{} is not an active candidate", raw));
            return Ok(());
        };

        println!();
        println!("{} {}", "Candidate:".bright_green(), raw.bright_cyan());
        println!("{} {}", "Origin:".bright_green(), version.origin.short());
        println!("{} {}", "Modified:".bright_green(), ui::format_millis(version.last_modified));
        match &version.body {
            Body::Document(content) => {
                println!("{} {}", "Content:".bright_green(), String::from_utf8_lossy(&content.data))
            }
            Body::Tombstone => println!("{} {}", "Content:".bright_green(), "<deleted>".red()),
        }
        ui::print_history(&version.history);
        println!();
        Ok(())
    }

    fn cmd_resolve(&self, args: &[&str]) -> Result<()> {
        match args.first() {
            Some(&"delete") => {
                let id = identity(&args[1..], "resolve delete <id>")?;
                self.node.resolve_by_delete(&id)?;
                ui::print_success(&format!("Resolved {} by delete", id));
            }
            Some(&"put") => {
                let (id, text) = identity_and_text(&args[1..], "resolve put <id> <text>")?;
                self.node.resolve_by_overwrite(&id, Content::new(text))?;
                ui::print_success(&format!("Resolved {} with a new version", id));
            }
            _ => bail!("Usage: resolve delete <id> | resolve put <id> <text>"),
        }
        Ok(())
    }

    async fn cmd_destinations(&self, args: &[&str]) -> Result<()> {
        match args {
            [] => {
                let destinations = self.node.destinations()?;
                println!();
                if destinations.is_empty() {
                    ui::print_info("No destinations configured");
                }
                for dest in destinations {
                    println!("  {} {}", dest.node_id.short().bright_cyan(), dest.address);
                }
                println!();
            }
            ["add", spec] => {
                let destination: Destination = spec.parse().map_err(anyhow::Error::msg)?;
                self.node.add_destination(destination.clone()).await?;
                ui::print_success(&format!("Replicating to {}", destination));
            }
            ["remove", node] => {
                let node_id: NodeId = node.parse().map_err(anyhow::Error::msg)?;
                if self.node.remove_destination(&node_id).await? {
                    ui::print_success(&format!("Stopped replicating to {}", node_id.short()));
                } else {
                    ui::print_warning(&format!("{} is not a destination", node_id.short()));
                }
            }
            _ => bail!("Usage: destinations [add <node-id>@<addr> | remove <node-id>]"),
        }
        Ok(())
    }

    fn cmd_stats(&self) -> Result<()> {
        println!();
        println!("{}", "Outbound:".bright_cyan().bold());
        for dest in self.node.replication_stats() {
            let s = &dest.stats;
            println!("  {} {}", dest.node_id.short().bright_yellow(), dest.address);
            println!(
                "    cursor {}  batches {}  items {}  heartbeats {}",
                s.cursor, s.batches_sent, s.items_sent, s.heartbeats_sent
            );
            if s.consecutive_failures > 0 {
                println!(
                    "    {} {} ({} in a row)",
                    "failing:".red(),
                    s.last_error.as_deref().unwrap_or("unknown"),
                    s.consecutive_failures
                );
            } else if let Some(at) = s.last_success {
                println!("    last success {}", ui::format_millis(at));
            }
        }

        println!("{}", "Inbound:".bright_cyan().bold());
        for (source, s) in self.node.receiver_stats() {
            println!("  {}", source.short().bright_yellow());
            println!(
                "    batches {}  applied {}  superseded {}  conflicted {}  rejected {}  malformed {}",
                s.batches, s.applied, s.superseded, s.conflicted, s.rejected, s.malformed
            );
            println!("    last accepted seq {}", s.last_accepted_seq);
        }
        let undecodable = self.node.receiver().undecodable_frames();
        if undecodable > 0 {
            println!("  {} {}", "undecodable frames:".red(), undecodable);
        }
        println!();
        Ok(())
    }

    async fn cmd_gc(&self) -> Result<()> {
        let node = Arc::clone(&self.node);
        let purged = tokio::task::spawn_blocking(move || node.collect_garbage())
            .await
            .context("tombstone collection task failed")??;
        ui::print_success(&format!("Purged {} tombstone(s)", purged));
        Ok(())
    }
}

fn identity(args: &[&str], usage: &str) -> Result<DocumentId> {
    match args.first() {
        Some(id) => Ok(DocumentId::from(*id)),
        None => bail!("Usage: {}", usage),
    }
}

fn identity_and_text(args: &[&str], usage: &str) -> Result<(DocumentId, String)> {
    if args.len() < 2 {
        bail!("Usage: {}", usage);
    }
    Ok((DocumentId::from(args[0]), args[1..].join(" ")))
}
