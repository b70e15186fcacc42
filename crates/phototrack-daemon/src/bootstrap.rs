use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tracing::Level;

use phototrack_core::TrackerConfig;

/// Optional env file consulted when no JSON config is given.
pub const DOTENV_PATH: &str = "config/.env";

/// Reads the JSON config at `path`, or the environment layout when no file is given.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<TrackerConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config {}", path.display()))
        }
        None => env_config(Path::new(DOTENV_PATH), |name| std::env::var(name).ok()),
    }
}

/// Builds the environment layout from `lookup`, falling back to the values in
/// `dotenv`. A missing env file is not an error.
pub fn env_config<F>(dotenv: &Path, lookup: F) -> anyhow::Result<TrackerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let file = read_dotenv(dotenv)?;
    TrackerConfig::from_vars(|name| lookup(name).or_else(|| file.get(name).cloned()))
        .context("failed to read config from environment")
}

fn read_dotenv(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let entries = match dotenvy::from_path_iter(path) {
        Ok(entries) => entries,
        Err(dotenvy::Error::Io(_)) => return Ok(HashMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read env file {}", path.display()));
        }
    };
    let mut vars = HashMap::new();
    for entry in entries {
        let (key, value) =
            entry.with_context(|| format!("failed to parse env file {}", path.display()))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

/// `--verbose` wins, then the configured level, then INFO.
pub fn log_level(configured: Option<&str>, verbose: bool) -> Level {
    if verbose {
        return Level::DEBUG;
    }
    configured
        .and_then(|level| level.trim().parse().ok())
        .unwrap_or(Level::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    #[test]
    fn json_file_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tracker.json");
        fs::write(
            &path,
            r#"{
                "roots": [{ "path": "/photos/alice", "user_id": "alice" }],
                "startup": true,
                "proc": { "host": "nas", "processes": 3 },
                "scan": { "recurse": "Inserted" }
            }"#,
        )
        .expect("write config");

        let config = load_config(Some(&path)).expect("config");
        assert_eq!(config.roots[0].path, PathBuf::from("/photos/alice"));
        assert!(config.startup);
        assert!(!config.watch);
        assert_eq!(config.proc.host, "nas");
        assert_eq!(config.proc.processes, 3);
        assert_eq!(config.scan.recurse, phototrack_core::RecursePolicy::Inserted);
    }

    #[test]
    fn unreadable_or_malformed_files_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing.json");
        let err = load_config(Some(&missing)).expect_err("missing file");
        assert!(err.to_string().contains("failed to read config"));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ roots: ").expect("write config");
        let err = load_config(Some(&broken)).expect_err("malformed file");
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn env_file_fills_in_missing_variables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dotenv = dir.path().join(".env");
        fs::write(
            &dotenv,
            "TRACKER_ROOTS=/photos/alice,/photos/bob\nTRACKER_USERS=alice,bob\nTRACKER_WATCH=true\n",
        )
        .expect("write env file");

        let config = env_config(&dotenv, |_| None).expect("config");
        assert_eq!(config.roots.len(), 2);
        assert_eq!(config.roots[1].path, PathBuf::from("/photos/bob"));
        assert_eq!(config.roots[1].user_id, "bob");
        assert!(config.watch);

        let config = env_config(&dotenv, |name| {
            (name == "TRACKER_USERS").then(|| "carol,dave".to_owned())
        })
        .expect("config");
        assert_eq!(config.roots[0].user_id, "carol");
        assert_eq!(config.roots[0].path, PathBuf::from("/photos/alice"));
    }

    #[test]
    fn missing_env_file_leaves_the_environment_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dotenv = dir.path().join("absent.env");

        let err = env_config(&dotenv, |_| None).expect_err("no roots anywhere");
        assert!(err.to_string().contains("failed to read config from environment"));

        let config = env_config(&dotenv, |name| match name {
            "TRACKER_ROOTS" => Some("/photos/alice".into()),
            "TRACKER_USERS" => Some("alice".into()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.roots.len(), 1);
    }

    #[test]
    fn verbose_overrides_configured_level() {
        assert_eq!(log_level(None, false), Level::INFO);
        assert_eq!(log_level(Some("warn"), false), Level::WARN);
        assert_eq!(log_level(Some("chatty"), false), Level::INFO);
        assert_eq!(log_level(Some("warn"), true), Level::DEBUG);
    }
}
