//! Text heuristics shared by source parsers: control-command detection
//! and working-directory inference.

use std::path::Path;
use std::sync::OnceLock;

/// True for user messages that are CLI control commands rather than
/// conversation: a single token starting with `/`, no newline, and only
/// alphanumeric, `_`, or `-` characters after the slash.
pub fn is_control_command(text: &str) -> bool {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return false;
    };
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn path_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Absolute or tilde-rooted path-like substrings
        regex::Regex::new(r"(?:~)?(?:/[A-Za-z0-9._@+-]+)+/?").unwrap_or_else(|_| unreachable!())
    })
}

/// Infer a working directory from free text when no log record states one.
///
/// Extracts absolute path candidates from the samples, normalizes them,
/// and returns the longest common component prefix, with a trailing
/// dot-containing component (likely a filename) removed.
pub fn infer_working_dir<'a>(samples: impl Iterator<Item = &'a str>) -> Option<String> {
    let home = std::env::var("HOME").ok();

    let mut candidates: Vec<Vec<String>> = Vec::new();
    for sample in samples {
        for m in path_pattern().find_iter(sample) {
            if let Some(components) = normalize_candidate(m.as_str(), home.as_deref()) {
                candidates.push(components);
            }
        }
    }
    if candidates.is_empty() {
        return None;
    }

    let mut prefix = candidates[0].clone();
    for candidate in &candidates[1..] {
        let shared = prefix
            .iter()
            .zip(candidate.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(shared);
        if prefix.is_empty() {
            return None;
        }
    }

    // A final component with a dot is usually a file, not a directory
    if prefix
        .last()
        .map(|c| c.contains('.'))
        .unwrap_or(false)
    {
        prefix.pop();
    }

    // A bare top-level directory like /home is too weak to act on
    if prefix.len() < 2 {
        return None;
    }

    Some(format!("/{}", prefix.join("/")))
}

/// Split one raw path match into normalized components.
fn normalize_candidate(raw: &str, home: Option<&str>) -> Option<Vec<String>> {
    let expanded = if let Some(rest) = raw.strip_prefix('~') {
        format!("{}{}", home?, rest)
    } else {
        raw.to_string()
    };

    let trimmed = expanded.trim_end_matches('/');
    let path = Path::new(trimmed);
    if !path.is_absolute() {
        return None;
    }

    let components: Vec<String> = trimmed
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_string)
        .collect();
    // Single-component matches like "/compact" are noise, not paths
    if components.len() < 2 {
        None
    } else {
        Some(components)
    }
}
