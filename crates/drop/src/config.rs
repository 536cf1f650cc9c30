//! Configuration Files
//!
//! Both programs read defaults from `$XDG_CONFIG_HOME/<program>.conf`
//! (`~/.config/<program>.conf` when the variable is unset). Each line holds
//! one long option name, optionally followed by its value:
//!
//! ```text
//! # upload to the lab server
//! port 7000
//! root "/srv/drop box"
//! v6only
//! ```
//!
//! A value wrapped in matching single or double quotes is taken without them.
//!
//! File entries are turned into command-line arguments and placed in front
//! of the real ones. An option given on the command line wins over the same
//! option in the file.

use std::collections::HashSet;
use std::env;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};

/// One option read from a configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: Option<String>,
}

/// Location of the configuration file for `program`, if a base directory is known
pub fn config_path(program: &str) -> Option<PathBuf> {
    let base = env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join(format!("{program}.conf")))
}

/// Parse configuration file contents. Blank lines and `#` comments are skipped.
pub fn parse_config(contents: &str) -> Vec<ConfigEntry> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, Some(unquote(value.trim()).to_string())),
                None => (line, None),
            };
            ConfigEntry {
                key: key.trim_start_matches('-').to_string(),
                value: value.filter(|value| !value.is_empty()),
            }
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|&quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

/// Read and parse a configuration file. A missing file is an empty configuration.
pub fn read_config(path: &Path) -> Result<Vec<ConfigEntry>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse_config(&contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Long option names given on the command line. `aliases` maps short flags to long names.
fn options_on_command_line(cli: &[String], aliases: &[(char, &str)]) -> HashSet<String> {
    let mut present = HashSet::new();
    for arg in cli {
        if arg == "--" {
            break;
        }
        if let Some(long) = arg.strip_prefix("--") {
            let name = long.split_once('=').map_or(long, |(name, _)| name);
            present.insert(name.to_string());
        } else if let Some(short) = arg.strip_prefix('-') {
            let mut chars = short.chars();
            if let (Some(flag), None) = (chars.next(), chars.next())
                && let Some((_, long)) = aliases.iter().find(|(alias, _)| *alias == flag)
            {
                present.insert(long.to_string());
            }
        }
    }
    present
}

/// Combine configuration file entries with command-line arguments.
///
/// A lone `-` (standard input) is protected from option parsing by an
/// end-of-options marker.
pub fn merge_args(file: &[ConfigEntry], cli: &[String], aliases: &[(char, &str)]) -> Vec<String> {
    let present = options_on_command_line(cli, aliases);

    let mut args = Vec::new();
    for entry in file.iter().filter(|entry| !present.contains(&entry.key)) {
        args.push(format!("--{}", entry.key));
        args.extend(entry.value.clone());
    }

    let mut options_ended = false;
    for arg in cli {
        if arg == "--" {
            options_ended = true;
        } else if arg == "-" && !options_ended {
            args.push("--".to_string());
            options_ended = true;
        }
        args.push(arg.clone());
    }
    args
}

/// Parse the process arguments for `program`, with defaults from its configuration file.
///
/// Behaves like `argh::from_env` for `--help` and usage errors.
pub fn from_env_with_config<T: FromArgs>(program: &str, aliases: &[(char, &str)]) -> Result<T> {
    let file = match config_path(program) {
        Some(path) => read_config(&path)?,
        None => Vec::new(),
    };
    let cli: Vec<String> = env::args().skip(1).collect();
    let args = merge_args(&file, &cli, aliases);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    match T::from_args(&[program], &arg_refs) {
        Ok(parsed) => Ok(parsed),
        Err(EarlyExit { output, status }) => match status {
            Ok(()) => {
                println!("{}", output);
                std::process::exit(0)
            }
            Err(()) => {
                eprintln!("{}\nRun {} --help for more information.", output, program);
                std::process::exit(1)
            }
        },
    }
}
