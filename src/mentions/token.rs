//! Mention token parsing and workspace-confined path resolution.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    // @path with an optional #L10 / #L10-20 / #L10-L20 suffix.
    Regex::new(r"@([A-Za-z0-9_~+./-]+)(?:#L(\d+)(?:-L?(\d+))?)?").unwrap()
});

/// A parsed `@path[#Lstart-Lend]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionToken {
    /// The token text after `@`, as written (snapshot/dedup key).
    pub raw: String,
    /// The path part, workspace-relative as written.
    pub path: String,
    /// Requested 1-indexed inclusive line range, if any.
    pub range: Option<(u32, u32)>,
}

/// Extract mention tokens from message text, in order of appearance.
pub fn parse_mentions(text: &str) -> Vec<MentionToken> {
    let mut tokens = Vec::new();
    for caps in MENTION_RE.captures_iter(text) {
        let mut path = caps.get(1).map_or("", |m| m.as_str());
        // Trailing prose punctuation is not part of the path.
        path = path.trim_end_matches(['.', ',', ';', ':']);
        if path.is_empty() {
            continue;
        }

        let range = match (caps.get(2), caps.get(3)) {
            (Some(start), Some(end)) => {
                match (start.as_str().parse::<u32>(), end.as_str().parse::<u32>()) {
                    (Ok(a), Ok(b)) => Some((a, b)),
                    _ => None,
                }
            }
            (Some(start), None) => start.as_str().parse::<u32>().ok().map(|a| (a, a)),
            _ => None,
        };

        let raw = match range {
            Some((a, b)) if a == b => format!("{path}#L{a}"),
            Some((a, b)) => format!("{path}#L{a}-L{b}"),
            None => path.to_string(),
        };

        tokens.push(MentionToken {
            raw,
            path: path.to_string(),
            range,
        });
    }
    tokens
}

/// Resolve a mention path strictly inside the workspace root.
///
/// Rejects absolute paths, home-relative (`~`) paths, and any lexical
/// traversal that escapes the root. No filesystem access happens here.
pub fn resolve_within_workspace(workspace_root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.starts_with('/') || relative.starts_with('~') {
        return None;
    }

    let mut stack: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => stack.push(part),
            // Popping past the workspace root is an escape.
            Component::ParentDir => {
                stack.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if stack.is_empty() {
        return None;
    }

    let mut resolved = workspace_root.to_path_buf();
    for part in stack {
        resolved.push(part);
    }
    Some(resolved)
}

/// Guess a fenced-block language tag from the file extension.
pub fn guess_language(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "rs" => "rust",
        "py" => "python",
        "ts" => "typescript",
        "tsx" => "tsx",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "jsx",
        "go" => "go",
        "java" => "java",
        "rb" => "ruby",
        "sh" | "bash" => "bash",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "c" | "h" => "c",
        "cc" | "cpp" | "hpp" | "cxx" => "cpp",
        "css" => "css",
        "html" => "html",
        "sql" => "sql",
        "txt" => "text",
        _ => "",
    }
}
