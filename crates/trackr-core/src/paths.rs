use crate::error::{Result, TrackrError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TRACKR_DIR: &str = ".trackr";
pub const CONFIG_FILE: &str = ".trackr/config.yaml";
pub const DATABASE_FILE: &str = "trackr.redb";
pub const RECOVERY_FILE: &str = "remaining_tasks.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn trackr_dir(root: &Path) -> PathBuf {
    root.join(TRACKR_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn database_path(root: &Path) -> PathBuf {
    trackr_dir(root).join(DATABASE_FILE)
}

pub fn recovery_path(root: &Path) -> PathBuf {
    trackr_dir(root).join(RECOVERY_FILE)
}

// ---------------------------------------------------------------------------
// Object names and aliases
// ---------------------------------------------------------------------------

/// Case-normalize an object name: the first letter after any non-letter is
/// upper-cased, every other letter lower-cased (`_alert_rules` → `_Alert_Rules`).
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_is_letter = false;
    for c in name.trim().chars() {
        if c.is_alphabetic() {
            if prev_is_letter {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_is_letter = true;
        } else {
            out.push(c);
            prev_is_letter = false;
        }
    }
    out
}

/// Derive a URL-safe alias from an object name.
pub fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

static ALIAS_RE: OnceLock<Regex> = OnceLock::new();

fn alias_re() -> &'static Regex {
    ALIAS_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]*$").unwrap())
}

pub fn validate_alias(alias: &str) -> Result<()> {
    if alias.is_empty() || alias.len() > 64 || !alias_re().is_match(alias) {
        return Err(TrackrError::InvalidDefinition(format!(
            "invalid alias '{alias}': must be lowercase alphanumeric with '_' or '-'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
