//! Daemon configuration file.
//!
//! An INI-like format with two sections:
//!
//! ```text
//! [general]
//! process_name = mx6e0
//! debug_log    = off
//! daemon       = no
//! startup_script = /etc/mx6e/startup.sh
//!
//! [device]
//! name_pr = eth0
//! name_fp = eth1
//! tunnel_pr = mx6etap0
//! tunnel_fp = mx6etap1
//! ipv6_address_pr = 2001:db8:2::/48
//! ipv6_address_fp = 2001:db8:46::/48
//! ```
//!
//! Parsing rejects unknown sections and keys, malformed addresses and
//! missing required fields; the daemon refuses to start on any of
//! them.

use std::fs;
use std::io::{self, Write};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};

use winnow::ascii::space0;
use winnow::combinator::delimited;
use winnow::error::ModalResult;
use winnow::prelude::*;
use winnow::token::{take_till, take_while};

use crate::addr::parse_v6_prefix;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: syntax error")]
    Syntax { line: usize },

    #[error("line {line}: unknown section [{name}]")]
    UnknownSection { line: usize, name: String },

    #[error("line {line}: unknown key {key}")]
    UnknownKey { line: usize, key: String },

    #[error("line {line}: invalid value for {key}: {value}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error("missing required key {key} in section [{section}]")]
    Missing {
        section: &'static str,
        key: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// `[general]` section.
#[derive(Debug, Clone, Default)]
pub struct GeneralConfig {
    /// Process identity; names the control socket.
    pub process_name: String,
    /// Start at DEBUG verbosity.
    pub debug_log: bool,
    /// Detach from the controlling terminal.
    pub daemon: bool,
    /// Script run in the background once the daemon is operational.
    pub startup_script: Option<PathBuf>,
}

/// `[device]` section.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Existing PR-side physical interface.
    pub name_pr: String,
    /// Existing FP-side physical interface.
    pub name_fp: String,
    /// TAP device to create on the PR side.
    pub tunnel_pr: String,
    /// TAP device to create on the FP side.
    pub tunnel_fp: String,
    /// PR tunnel prefix; supplies the PR-side section and source prefix.
    pub ipv6_address_pr: (Ipv6Addr, u8),
    /// FP tunnel prefix.
    pub ipv6_address_fp: Option<(Ipv6Addr, u8)>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name_pr: String::default(),
            name_fp: String::default(),
            tunnel_pr: String::default(),
            tunnel_fp: String::default(),
            ipv6_address_pr: (Ipv6Addr::UNSPECIFIED, 0),
            ipv6_address_fp: None,
        }
    }
}

/// The loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub general: GeneralConfig,
    pub device: DeviceConfig,
}

/// Parse a boolean in the accepted operator spellings.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "yes" | "on" | "enable" => Some(true),
        "no" | "off" | "disable" => Some(false),
        _ => None,
    }
}

/// One meaningful configuration line.
enum Line<'a> {
    Section(&'a str),
    KeyValue(&'a str, &'a str),
    Blank,
}

fn section<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    delimited(('[', space0), take_till(1.., |c| c == ']'), (space0, ']'))
        .map(str::trim)
        .parse_next(input)
}

fn key_value<'a>(input: &mut &'a str) -> ModalResult<(&'a str, &'a str)> {
    let key = take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    })
    .parse_next(input)?;
    let _ = (space0, '=', space0).parse_next(input)?;
    let value = take_while(0.., |c: char| c != '#').parse_next(input)?;
    Ok((key, value.trim()))
}

fn classify(raw: &str) -> Option<Line<'_>> {
    let text = match raw.split_once('#') {
        Some((before, _)) => before.trim(),
        None => raw.trim(),
    };
    if text.is_empty() {
        return Some(Line::Blank);
    }
    if text.starts_with('[') {
        return section.parse(text).ok().map(Line::Section);
    }
    key_value.parse(text).ok().map(|(k, v)| Line::KeyValue(k, v))
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    General,
    Device,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Config> {
        let mut config = Config::default();
        let mut current = Section::None;
        let mut seen_pr_addr = false;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let parsed = classify(raw).ok_or(ConfigError::Syntax { line })?;
            match parsed {
                Line::Blank => {}
                Line::Section(name) => {
                    current = match name.to_ascii_lowercase().as_str() {
                        "general" => Section::General,
                        "device" => Section::Device,
                        _ => {
                            return Err(ConfigError::UnknownSection {
                                line,
                                name: name.to_string(),
                            });
                        }
                    };
                }
                Line::KeyValue(key, value) => {
                    let invalid = || ConfigError::InvalidValue {
                        line,
                        key: key.to_string(),
                        value: value.to_string(),
                    };
                    match current {
                        Section::None => return Err(ConfigError::Syntax { line }),
                        Section::General => match key.to_ascii_lowercase().as_str() {
                            "process_name" => config.general.process_name = value.to_string(),
                            "debug_log" => {
                                config.general.debug_log =
                                    parse_bool(value).ok_or_else(invalid)?;
                            }
                            "daemon" => {
                                config.general.daemon = parse_bool(value).ok_or_else(invalid)?;
                            }
                            "startup_script" => {
                                config.general.startup_script = Some(PathBuf::from(value));
                            }
                            _ => {
                                return Err(ConfigError::UnknownKey {
                                    line,
                                    key: key.to_string(),
                                });
                            }
                        },
                        Section::Device => match key.to_ascii_lowercase().as_str() {
                            "name_pr" => config.device.name_pr = value.to_string(),
                            "name_fp" => config.device.name_fp = value.to_string(),
                            "tunnel_pr" => config.device.tunnel_pr = value.to_string(),
                            "tunnel_fp" => config.device.tunnel_fp = value.to_string(),
                            "ipv6_address_pr" => {
                                config.device.ipv6_address_pr =
                                    parse_v6_prefix(value).map_err(|_| invalid())?;
                                seen_pr_addr = true;
                            }
                            "ipv6_address_fp" => {
                                config.device.ipv6_address_fp =
                                    Some(parse_v6_prefix(value).map_err(|_| invalid())?);
                            }
                            _ => {
                                return Err(ConfigError::UnknownKey {
                                    line,
                                    key: key.to_string(),
                                });
                            }
                        },
                    }
                }
            }
        }

        config.validate(seen_pr_addr)?;
        Ok(config)
    }

    fn validate(&self, seen_pr_addr: bool) -> Result<()> {
        fn required(section: &'static str, key: &'static str, value: &str) -> Result<()> {
            if value.is_empty() {
                return Err(ConfigError::Missing { section, key });
            }
            Ok(())
        }

        required("general", "process_name", &self.general.process_name)?;
        required("device", "name_pr", &self.device.name_pr)?;
        required("device", "name_fp", &self.device.name_fp)?;
        required("device", "tunnel_pr", &self.device.tunnel_pr)?;
        required("device", "tunnel_fp", &self.device.tunnel_fp)?;
        if !seen_pr_addr || self.device.ipv6_address_pr.1 == 0 {
            return Err(ConfigError::Missing {
                section: "device",
                key: "ipv6_address_pr",
            });
        }
        Ok(())
    }

    /// Write the configuration back in file syntax (`show conf`).
    pub fn dump(&self, w: &mut dyn Write) -> io::Result<()> {
        let strbool = |b: bool| if b { "yes" } else { "no" };

        writeln!(w, "[general]")?;
        writeln!(w, "process_name = {}", self.general.process_name)?;
        writeln!(w, "debug_log = {}", strbool(self.general.debug_log))?;
        writeln!(w, "daemon = {}", strbool(self.general.daemon))?;
        if let Some(script) = &self.general.startup_script {
            writeln!(w, "startup_script = {}", script.display())?;
        }
        writeln!(w)?;
        writeln!(w, "[device]")?;
        writeln!(w, "name_pr = {}", self.device.name_pr)?;
        writeln!(w, "name_fp = {}", self.device.name_fp)?;
        writeln!(w, "tunnel_pr = {}", self.device.tunnel_pr)?;
        writeln!(w, "tunnel_fp = {}", self.device.tunnel_fp)?;
        let (addr, len) = self.device.ipv6_address_pr;
        writeln!(w, "ipv6_address_pr = {addr}/{len}")?;
        if let Some((addr, len)) = self.device.ipv6_address_fp {
            writeln!(w, "ipv6_address_fp = {addr}/{len}")?;
        }
        Ok(())
    }
}
