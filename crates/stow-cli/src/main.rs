//! `stow`: offline inspection of stored settings documents

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use stow_core::StoredDocument;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    let file = || {
        Arg::new("file")
            .required(true)
            .value_parser(value_parser!(PathBuf))
            .help("Stored document to read")
    };

    Command::new("stow")
        .version(stow_core::VERSION)
        .about("Inspect stored settings documents")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("inspect")
                .about("Show applied upfixers, groups, and value count")
                .arg(file())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(Command::new("keys").about("List stored value keys").arg(file()))
        .subcommand(
            Command::new("stale")
                .about("List stored keys missing from the exported defaults")
                .arg(file())
                .arg(
                    Arg::new("defaults")
                        .long("defaults")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Exported defaults document"),
                ),
        )
}

/// Read a document without touching the file, even if it is corrupt
fn read_document(path: &Path) -> Result<StoredDocument> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(StoredDocument::new());
    }
    StoredDocument::from_slice(&bytes).with_context(|| format!("{} is not a settings document", path.display()))
}

fn path_arg<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a PathBuf> {
    args.get_one::<PathBuf>(name)
        .with_context(|| format!("missing <{name}> argument"))
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct Summary {
    upfixers: Vec<String>,
    groups: BTreeMap<String, Vec<u32>>,
    values: usize,
}

impl Summary {
    fn of(document: &StoredDocument) -> Self {
        Self {
            upfixers: document.applied_upfixers(),
            groups: document.groups(),
            values: document.value_count(),
        }
    }

    fn render(&self) -> String {
        let mut out = format!("values: {}\n", self.values);
        out.push_str(&format!("upfixers ({}):\n", self.upfixers.len()));
        for name in &self.upfixers {
            out.push_str(&format!("  {name}\n"));
        }
        out.push_str(&format!("groups ({}):\n", self.groups.len()));
        for (key, ids) in &self.groups {
            out.push_str(&format!("  {key}: {ids:?}\n"));
        }
        out
    }
}

/// Value keys of `user` that `defaults` does not know
fn stale_keys(user: &StoredDocument, defaults: &StoredDocument) -> Vec<String> {
    let mut stale: Vec<String> = user
        .value_keys()
        .filter(|key| !defaults.contains_key(key))
        .map(str::to_string)
        .collect();
    stale.sort();
    stale
}

fn run(matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("inspect", args)) => {
            let path = path_arg(args, "file")?;
            let summary = Summary::of(&read_document(path)?);
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary.render());
            }
        }
        Some(("keys", args)) => {
            let document = read_document(path_arg(args, "file")?)?;
            let mut keys: Vec<&str> = document.value_keys().collect();
            keys.sort_unstable();
            for key in keys {
                println!("{key}");
            }
        }
        Some(("stale", args)) => {
            let user = read_document(path_arg(args, "file")?)?;
            let defaults = read_document(path_arg(args, "defaults")?)?;
            let stale = stale_keys(&user, &defaults);
            tracing::info!(stale = stale.len(), "compared against defaults");
            for key in stale {
                println!("{key}");
            }
        }
        _ => unreachable!("subcommand is required"),
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    run(&cli().get_matches())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn document(value: serde_json::Value) -> StoredDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn command_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn stale_requires_defaults() {
        assert!(cli().try_get_matches_from(["stow", "stale", "user.conf.json"]).is_err());
        assert!(cli()
            .try_get_matches_from(["stow", "stale", "user.conf.json", "--defaults", "default.conf.json"])
            .is_ok());
    }

    #[test]
    fn summary_counts_values_only() {
        let summary = Summary::of(&document(json!({
            "$upfixers": ["a", "b"],
            "$groups": {"overlay.infoBoxes": [1, 3]},
            "feature.minimap.radius": 35,
        })));

        assert_eq!(summary.upfixers, vec!["a", "b"]);
        assert_eq!(summary.groups.get("overlay.infoBoxes"), Some(&vec![1, 3]));
        assert_eq!(summary.values, 1);
        assert!(summary.render().starts_with("values: 1\n"));
    }

    #[test]
    fn stale_keys_skip_reserved_entries() {
        let user = document(json!({
            "$upfixers": ["a"],
            "feature.removed.flag": true,
            "feature.minimap.radius": 35,
            "feature.old.size": 2,
        }));
        let defaults = document(json!({"feature.minimap.radius": 20}));

        assert_eq!(stale_keys(&user, &defaults), vec!["feature.old.size", "feature.removed.flag"]);
    }

    #[test]
    fn blank_file_reads_as_empty_and_garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blank = dir.path().join("blank.conf.json");
        let broken = dir.path().join("broken.conf.json");
        fs::write(&blank, "\n").unwrap();
        fs::write(&broken, "{").unwrap();

        assert!(read_document(&blank).unwrap().is_empty());
        assert!(read_document(&broken).is_err());
        assert!(broken.exists());
    }
}
