use super::Opts;
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use fleet_core::config::{Config, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,

    /// Set one engine setting, e.g. `engine.workers 8`
    Set { key: String, value: String },

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, opts: Opts) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, opts),
        ConfigSubcommand::Set { key, value } => set(root, &key, &value),
        ConfigSubcommand::Validate => validate(root, opts),
    }
}

fn show(root: &Path, opts: Opts) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if opts.json {
        return print_json(&config);
    }
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn set(root: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let mut tree = serde_yaml::to_value(&config)?;

    let mut slot = &mut tree;
    for part in key.split('.') {
        slot = slot
            .get_mut(part)
            .with_context(|| format!("unknown config key '{key}'"))?;
    }
    if slot.is_mapping() {
        anyhow::bail!("'{key}' is a section, not a setting");
    }
    *slot = serde_yaml::from_str(value).with_context(|| format!("invalid value '{value}'"))?;

    let updated: Config = serde_yaml::from_value(tree)
        .with_context(|| format!("invalid value '{value}' for {key}"))?;
    updated.save(root).context("failed to save config")?;
    println!("{key} = {value}");
    Ok(())
}

fn validate(root: &Path, opts: Opts) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();

    if opts.json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
