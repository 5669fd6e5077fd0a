//! `SecretMap` loading from a `KEY=VALUE` file (spec §3/§6).

use std::collections::HashMap;
use std::path::Path;

/// variable name -> secret value. Case-sensitive keys.
pub type SecretMap = HashMap<String, String>;

/// Load a secret map from a `KEY=VALUE` file. Blank lines and lines
/// starting with `#` are skipped; whitespace around key and value is
/// trimmed; a single matching pair of surrounding `'` or `"` on the
/// value is stripped. No escape sequences are interpreted. Duplicate
/// keys: last wins. An absent file is an empty map, not an error.
pub fn load(path: &Path) -> SecretMap {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return SecretMap::new(),
    };
    parse(&content)
}

/// Parse already-read file contents (split out for unit testing).
pub fn parse(content: &str) -> SecretMap {
    let mut map = SecretMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = strip_quotes(value.trim());
        map.insert(key.to_string(), value.to_string());
    }
    map
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
