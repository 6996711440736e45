//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// limiquantix block job tool - inspect and clean up persisted block jobs
#[derive(Parser, Debug)]
#[command(name = "limiquantix-blockjobctl")]
#[command(about = "Inspect and clean up block jobs recorded in domain status files")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Directory holding the domain status files (overrides config)
    #[arg(long, env = "LIMIQUANTIX_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List block jobs, including ones that could not be restored
    List {
        /// Only this domain
        domain: Option<String>,
    },

    /// Show one block job in detail
    Show { domain: String, job: String },

    /// Remove a block job from a domain's status file
    Remove { domain: String, job: String },

    /// Parse every status file and report problems
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remove() {
        let args = Args::parse_from([
            "limiquantix-blockjobctl",
            "--state-dir",
            "/tmp/qemu",
            "remove",
            "vm1",
            "commit-vda",
        ]);
        assert_eq!(args.state_dir, Some(PathBuf::from("/tmp/qemu")));
        match args.command {
            Command::Remove { domain, job } => {
                assert_eq!(domain, "vm1");
                assert_eq!(job, "commit-vda");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_list_domain_is_optional() {
        let args = Args::parse_from(["limiquantix-blockjobctl", "list"]);
        assert!(matches!(args.command, Command::List { domain: None }));
        assert_eq!(args.log_level, "warn");
    }
}
