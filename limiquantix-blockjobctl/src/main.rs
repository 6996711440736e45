//! # limiquantix Block Job Tool
//!
//! Operator tool working directly on the domain status files written by the
//! block job core. Jobs that could not be restored (unknown type, dangling
//! node references) are never cleaned up automatically; this is where they
//! are listed and removed.
//!
//! ## Usage
//! ```bash
//! limiquantix-blockjobctl list
//! limiquantix-blockjobctl show vm1 commit-vda
//! limiquantix-blockjobctl --state-dir /var/run/limiquantix/qemu remove vm1 commit-vda
//! limiquantix-blockjobctl check
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{debug, error, info};

use limiquantix_blockjob::{DriverConfig, StatusStore};

mod cli;
mod commands;

use cli::{Args, Command};

const DEFAULT_CONFIG_PATH: &str = "/etc/limiquantix/blockjob.yaml";

fn load_config(args: &Args) -> Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => DriverConfig::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load configuration from {}", DEFAULT_CONFIG_PATH))?,
        None => {
            debug!("No configuration file, using defaults");
            DriverConfig::default()
        }
    };

    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    Ok(config)
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn run(args: &Args, store: &StatusStore) -> Result<bool> {
    match &args.command {
        Command::List { domain } => {
            let jobs = commands::list(store, domain.as_deref())?;
            print(args.json, &jobs, |jobs| {
                println!("{:<16} {:<20} {:<16} {:<10} {:<6} INVALID", "DOMAIN", "JOB", "TYPE", "STATE", "DISK");
                for j in jobs {
                    println!(
                        "{:<16} {:<20} {:<16} {:<10} {:<6} {}",
                        j.domain,
                        j.name,
                        j.job_type,
                        j.state,
                        j.disk.as_deref().unwrap_or("-"),
                        if j.invalid { "yes" } else { "no" }
                    );
                }
            })?;
        }
        Command::Show { domain, job } => {
            let detail = commands::show(store, domain, job)?;
            print(args.json, &detail, |d| {
                println!("Job:      {} ({})", d.summary.name, d.summary.domain);
                println!("Type:     {}", d.summary.job_type);
                println!("State:    {}", d.summary.state);
                if let Some(newstate) = &d.newstate {
                    println!("Pending:  {}", newstate);
                }
                if let Some(errmsg) = &d.errmsg {
                    println!("Error:    {}", errmsg);
                }
                if let Some(disk) = &d.summary.disk {
                    println!("Disk:     {}{}", disk, if d.mirror { " (with mirror)" } else { "" });
                }
                println!("Flags:    {}", d.jobflags.as_deref().unwrap_or("not recorded"));
                println!("Invalid:  {}", if d.summary.invalid { "yes" } else { "no" });
                for (i, layer) in d.chain.iter().enumerate() {
                    println!("Chain[{}]: {}", i, layer);
                }
                for (role, node) in &d.nodes {
                    println!("{:<9} {}", format!("{}:", role), node);
                }
            })?;
        }
        Command::Remove { domain, job } => {
            let removed = commands::remove(store, domain, job)?;
            print(args.json, &removed, |r| println!("Removed {} from {}", r.name, r.domain))?;
        }
        Command::Check => {
            let reports = commands::check(store)?;
            let clean = reports.iter().all(|r| r.is_clean());
            print(args.json, &reports, |reports| {
                for r in reports {
                    match (&r.error, r.invalid_jobs.is_empty()) {
                        (Some(e), _) => println!("{}: unreadable: {}", r.domain, e),
                        (None, true) => println!("{}: ok", r.domain),
                        (None, false) => println!("{}: invalid jobs: {}", r.domain, r.invalid_jobs.join(", ")),
                    }
                }
            })?;
            return Ok(clean);
        }
    }
    Ok(true)
}

fn main() -> Result<()> {
    let args = Args::parse();

    limiquantix_common::init_logging(&args.log_level)?;

    let config = load_config(&args)?;
    let store = StatusStore::from_config(&config);
    info!(state_dir = %store.state_dir().display(), "Using state directory");

    match run(&args, &store) {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            Err(e)
        }
    }
}
