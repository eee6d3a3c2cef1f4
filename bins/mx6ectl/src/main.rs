//! mx6ectl - administrative CLI for the MX6E translation gateway.
//!
//! Talks to a running `mx6ed` instance over its command socket,
//! addressed by process name.

mod args;
mod client;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};

use mx6e::command::Request;

/// Exit code for CLI usage errors (EINVAL).
const EXIT_USAGE: i32 = 22;

#[derive(Parser)]
#[command(name = "mx6ectl", version, about = "MX6E translation gateway control tool")]
struct Cli {
    /// Process name of the target gateway.
    #[arg(short = 'n', long = "name")]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a translation entry.
    ///
    /// add m46e pr - IN_PLANE IN_PREFIX_LEN V4NET/CIDR V6NET/LEN OUT_PLANE enable|disable
    /// add m46e fp SECTION IN_PLANE IN_PREFIX_LEN V4NET/CIDR V6NET/LEN OUT_PLANE enable|disable
    /// (me6e takes a MAC address in place of V4NET/CIDR)
    #[command(verbatim_doc_comment)]
    Add {
        table: String,
        domain: String,
        /// Section device prefix for fp, "-" for pr.
        section: String,
        in_plane_id: String,
        in_prefix_len: String,
        /// IPv4 network (m46e) or MAC address (me6e).
        inner: String,
        out_prefix: String,
        out_plane_id: String,
        /// enable or disable.
        mode: String,
    },

    /// Delete a translation entry.
    Del {
        table: String,
        domain: String,
        section: String,
        in_plane_id: String,
        in_prefix_len: String,
        inner: String,
    },

    /// Delete every entry of a table.
    Delall { table: String },

    /// Enable a translation entry.
    Enable {
        table: String,
        domain: String,
        section: String,
        in_plane_id: String,
        in_prefix_len: String,
        inner: String,
    },

    /// Disable a translation entry.
    Disable {
        table: String,
        domain: String,
        section: String,
        in_plane_id: String,
        in_prefix_len: String,
        inner: String,
    },

    /// Show a rule table (m46e, me6e), statistics (stat) or the
    /// loaded configuration (conf).
    Show { object: String },

    /// Change a runtime setting (currently: debug on|off).
    Set { object: String, mode: String },

    /// Replay commands from a file, one per non-comment line.
    Load { table: String, file: PathBuf },

    /// Stop the gateway.
    Shutdown,

    /// Restart the gateway.
    Restart,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    match run(&cli) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("mx6ectl: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Add {
            table,
            domain,
            section,
            in_plane_id,
            in_prefix_len,
            inner,
            out_prefix,
            out_plane_id,
            mode,
        } => {
            let kind = args::parse_kind(table)?;
            let spec = args::parse_add(
                kind,
                domain,
                section,
                in_plane_id,
                in_prefix_len,
                inner,
                out_prefix,
                out_plane_id,
                mode,
            )?;
            let request = match kind {
                mx6e::RuleKind::M46e => Request::AddM46e(spec),
                mx6e::RuleKind::Me6e => Request::AddMe6e(spec),
            };
            client::execute(&cli.name, &request)
        }
        Command::Del {
            table,
            domain,
            section,
            in_plane_id,
            in_prefix_len,
            inner,
        } => {
            let kind = args::parse_kind(table)?;
            let key = args::parse_key(kind, domain, section, in_plane_id, in_prefix_len, inner)?;
            let request = match kind {
                mx6e::RuleKind::M46e => Request::DelM46e(key),
                mx6e::RuleKind::Me6e => Request::DelMe6e(key),
            };
            client::execute(&cli.name, &request)
        }
        Command::Delall { table } => {
            let request = match args::parse_kind(table)? {
                mx6e::RuleKind::M46e => Request::DelAllM46e,
                mx6e::RuleKind::Me6e => Request::DelAllMe6e,
            };
            client::execute(&cli.name, &request)
        }
        Command::Enable {
            table,
            domain,
            section,
            in_plane_id,
            in_prefix_len,
            inner,
        } => {
            let kind = args::parse_kind(table)?;
            let key = args::parse_key(kind, domain, section, in_plane_id, in_prefix_len, inner)?;
            let request = match kind {
                mx6e::RuleKind::M46e => Request::EnableM46e(key),
                mx6e::RuleKind::Me6e => Request::EnableMe6e(key),
            };
            client::execute(&cli.name, &request)
        }
        Command::Disable {
            table,
            domain,
            section,
            in_plane_id,
            in_prefix_len,
            inner,
        } => {
            let kind = args::parse_kind(table)?;
            let key = args::parse_key(kind, domain, section, in_plane_id, in_prefix_len, inner)?;
            let request = match kind {
                mx6e::RuleKind::M46e => Request::DisableM46e(key),
                mx6e::RuleKind::Me6e => Request::DisableMe6e(key),
            };
            client::execute(&cli.name, &request)
        }
        Command::Show { object } => {
            let request = match object.to_ascii_lowercase().as_str() {
                "m46e" => Request::ShowM46e,
                "me6e" => Request::ShowMe6e,
                "stat" => Request::ShowStatistics,
                "conf" => Request::ShowConfig,
                other => anyhow::bail!("unknown show object {other:?}"),
            };
            client::execute(&cli.name, &request)
        }
        Command::Set { object, mode } => {
            if object.to_ascii_lowercase() != "debug" {
                anyhow::bail!("unknown set object {object:?}");
            }
            let on = mx6e::config::parse_bool(mode)
                .with_context(|| format!("expected on or off, got {mode:?}"))?;
            client::execute(&cli.name, &Request::SetDebugLog(on))
        }
        Command::Load { table, file } => client::load(&cli.name, table, file),
        Command::Shutdown => client::execute(&cli.name, &Request::Shutdown),
        Command::Restart => client::execute(&cli.name, &Request::Restart),
    }
}
