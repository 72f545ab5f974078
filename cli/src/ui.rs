//! UI utilities for pretty printing

use colored::Colorize;
use replidoc_core::{Document, History};

pub fn print_help() {
    println!();
    println!("{}", "Available Commands:".bright_cyan().bold());
    println!();
    println!("  {:<36} {}", "help".bright_green(), "Show this help message");
    println!("  {:<36} {}", "quit, exit".bright_green(), "Exit the application");
    println!();
    println!("  {}", "Documents:".bright_yellow().bold());
    println!("  {:<36} {}", "get <id>".bright_green(), "Read a document");
    println!("  {:<36} {}", "put <id> <text>".bright_green(), "Write a document");
    println!("  {:<36} {}", "delete <id>".bright_green(), "Delete a document");
    println!("  {:<36} {}", "history <id>".bright_green(), "Show the version history");
    println!();
    println!("  {}", "Conflicts:".bright_yellow().bold());
    println!("  {:<36} {}", "conflicts".bright_green(), "List unresolved conflicts");
    println!("  {:<36} {}", "candidate <candidate-id>".bright_green(), "Show one conflict candidate");
    println!("  {:<36} {}", "resolve delete <id>".bright_green(), "Resolve by deleting");
    println!("  {:<36} {}", "resolve put <id> <text>".bright_green(), "Resolve by writing a new version");
    println!();
    println!("  {}", "Replication:".bright_yellow().bold());
    println!("  {:<36} {}", "destinations".bright_green(), "List destinations");
    println!("  {:<36} {}", "destinations add <node-id>@<addr>".bright_green(), "Replicate to a node");
    println!("  {:<36} {}", "destinations remove <node-id>".bright_green(), "Stop replicating to a node");
    println!("  {:<36} {}", "stats".bright_green(), "Show replication counters");
    println!("  {:<36} {}", "gc".bright_green(), "Collect acknowledged tombstones now");
    println!();
    println!("  {}", "Info:".bright_yellow().bold());
    println!("  {:<36} {}", "whoami".bright_green(), "Show node identity");
    println!("  {:<36} {}", "version".bright_green(), "Show version and build info");
    println!();
}

pub fn print_document(doc: &Document) {
    println!();
    println!("{} {}", "Document:".bright_green(), doc.identity.to_string().bright_cyan());
    println!("{} {}", "Content:".bright_green(), String::from_utf8_lossy(&doc.content.data));
    for (key, value) in &doc.content.metadata {
        println!("  {} {}", format!("{}:", key).bright_blue(), value);
    }
    println!("{} {}", "ETag:".bright_green(), doc.etag);
    println!("{} {}", "Origin:".bright_green(), doc.origin.short());
    println!("{} {}", "Modified:".bright_green(), format_millis(doc.last_modified));
    print_history(&doc.history);
    println!();
}

pub fn print_history(history: &History) {
    println!("{}", "History:".bright_green());
    for entry in history.entries() {
        println!("  {} {}", entry.node.short().bright_blue(), entry.etag);
    }
}

pub fn format_millis(millis: u64) -> String {
    chrono::DateTime::from_timestamp_millis(millis as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn print_error(msg: &str) {
    println!("{} {}", "✗".bright_red(), msg.red());
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".bright_green(), msg.bright_green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".bright_blue(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".bright_yellow(), msg.yellow());
}
