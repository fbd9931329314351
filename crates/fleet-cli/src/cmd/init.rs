use anyhow::Context;
use fleet_core::{config::Config, io, paths, store::Store};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing fleet in: {}", root.display());

    let dir = paths::fleet_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let yaml = serde_yaml::to_string(&Config::default())?;
    if io::write_if_missing(&paths::config_path(root), yaml.as_bytes())
        .context("failed to write config.yaml")?
    {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }

    let db = paths::db_path(root);
    let existed = db.exists();
    Store::open(&db).context("failed to create store")?;
    if existed {
        println!("  exists:  {}", paths::DB_FILE);
    } else {
        println!("  created: {}", paths::DB_FILE);
    }
    Ok(())
}
