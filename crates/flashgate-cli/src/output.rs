//! Output formatting for CLI responses

use anyhow::{Error, Result};
use colored::*;
use flashgate_update::{
    AppDescriptor, ImageDescriptor, PartitionInfo, PartitionRole, SessionReport, VersionDecision,
};
use serde_json::{Value, json};
use std::path::Path;

use crate::error::error_type_name;

fn emit(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    let error_json = json!({
        "success": false,
        "error": {
            "message": format!("{error:#}"),
            "type": error_type_name(error)
        }
    });
    match serde_json::to_string_pretty(&error_json) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to format error as JSON: {}", e),
    }
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

fn role_label(role: PartitionRole) -> &'static str {
    match role {
        PartitionRole::Running => "running",
        PartitionRole::Boot => "boot",
        PartitionRole::StagingCandidate => "staging",
        PartitionRole::LastFailed => "last-failed",
    }
}

fn print_partitions_human(infos: &[PartitionInfo]) {
    for info in infos {
        let version = info
            .descriptor
            .as_ref()
            .map_or_else(|| "(empty)".dimmed().to_string(), |d| d.version.to_string());
        let roles: Vec<&str> = info.roles.iter().map(|r| role_label(*r)).collect();
        let marker = if info.has_role(PartitionRole::LastFailed) {
            "●".red()
        } else if info.has_role(PartitionRole::Running) {
            "●".green()
        } else {
            "●".dimmed()
        };
        println!(
            "  {} {:<8} 0x{:08x} {:>8} bytes  {:<16} {}",
            marker,
            info.partition.label.bold(),
            info.partition.offset,
            info.partition.size,
            version,
            if roles.is_empty() {
                String::new()
            } else {
                format!("[{}]", roles.join(", ")).cyan().to_string()
            }
        );
    }
}

/// Print the partition table of a flash directory
pub fn print_status(dir: &Path, infos: &[PartitionInfo], json: bool) -> Result<()> {
    if json {
        return emit(&json!({
            "success": true,
            "flash": dir,
            "partitions": infos,
        }));
    }
    println!("{} {}", "Flash layout:".bold(), dir.display());
    print_partitions_human(infos);
    Ok(())
}

/// Print the outcome of a simulated restart
pub fn print_transition(message: &str, infos: &[PartitionInfo], json: bool) -> Result<()> {
    if json {
        return emit(&json!({
            "success": true,
            "message": message,
            "partitions": infos,
        }));
    }
    println!("{} {}", "✓".green(), message);
    print_partitions_human(infos);
    Ok(())
}

fn print_app_human(app: &AppDescriptor) {
    println!("  Version:        {}", app.version.to_string().bold());
    println!("  Project:        {}", app.project_name);
    println!("  Secure version: {}", app.secure_version);
    println!("  Built:          {} {}", app.build_date, app.build_time);
    println!("  SDK:            {}", app.sdk_version);
}

/// Print a decoded header window
pub fn print_descriptor(path: &Path, len: usize, desc: &ImageDescriptor, json: bool) -> Result<()> {
    if json {
        return emit(&json!({
            "success": true,
            "image": path,
            "size": len,
            "descriptor": desc,
        }));
    }
    println!("{} {} ({} bytes)", "Image:".bold(), path.display(), len);
    print_app_human(&desc.app);
    println!("  Segments:       {}", desc.header.segment_count);
    println!("  Entry point:    0x{:08x}", desc.header.entry_addr);
    Ok(())
}

/// Print a freshly built image
pub fn print_built(path: &Path, len: usize, app: &AppDescriptor, json: bool) -> Result<()> {
    if json {
        return emit(&json!({
            "success": true,
            "image": path,
            "size": len,
            "descriptor": app,
        }));
    }
    println!("{} Wrote {} ({} bytes)", "✓".green(), path.display(), len);
    print_app_human(app);
    Ok(())
}

/// Print the report of a committed session
pub fn print_report(report: &SessionReport, restart_requested: bool, json: bool) -> Result<()> {
    if json {
        return emit(&json!({
            "success": true,
            "report": report,
            "restart_requested": restart_requested,
        }));
    }

    println!("{}", "Update committed".green().bold());
    println!("  Session:        {}", report.session_id);
    println!("  Target:         {}", report.target);
    println!(
        "  Written:        {}/{} bytes",
        report.bytes_written, report.declared_length
    );
    println!("  SHA-256:        {}", report.sha256);
    if let Some(app) = &report.descriptor {
        println!("  Version:        {}", app.version.to_string().bold());
    }
    match report.decision {
        Some(VersionDecision::Proceed) | None => {}
        Some(decision) => println!("  Policy:         {}", format!("{decision:?}").yellow()),
    }
    for warning in &report.warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
    println!(
        "  Duration:       {} ms",
        (report.finished_at - report.started_at).num_milliseconds()
    );
    if restart_requested {
        println!("{}", "Restart requested".cyan().bold());
    }
    Ok(())
}
