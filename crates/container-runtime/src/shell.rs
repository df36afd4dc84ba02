//! Shell command helpers

use std::collections::BTreeMap;

/// Quote a string for safe use as one POSIX shell word
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `export K=V; ...` prefix for a set of variables
pub(crate) fn export_prefix(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("export {}={}; ", key, shell_quote(value)))
        .collect()
}

/// Replace credentials embedded in git remote URLs
pub fn redact_tokens(text: &str) -> String {
    const MARKER: &str = "x-access-token:";
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(MARKER) {
        let after = start + MARKER.len();
        result.push_str(&rest[..after]);
        match rest[after..].find('@') {
            Some(end) => {
                result.push_str("***");
                rest = &rest[after + end..];
            }
            None => {
                rest = &rest[after..];
            }
        }
    }
    result.push_str(rest);
    result
}
