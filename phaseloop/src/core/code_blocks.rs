//! Extraction of file contents from fenced code blocks in model responses.
//!
//! A fence header names the target file in one of these forms:
//! - ```` ```src/main.rs ```` (a path, possibly containing spaces)
//! - ```` ```file: src/main.rs ````
//! - ```` ```rust ```` followed by a first line like `// file: src/main.rs`
//!
//! Blocks without any path hint get `generated_<n>.<ext>` where the extension
//! follows the language tag.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([^\n]*)\n(.*?)```").expect("fence regex should be valid")
});

static HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#|//|--|/\*|<!--)\s*(?:file|path)\s*:\s*(.+?)\s*(?:\*/|-->)?\s*$")
        .expect("path hint regex should be valid")
});

const LANGUAGE_TAGS: &[(&str, &str)] = &[
    ("python", "py"),
    ("py", "py"),
    ("rust", "rs"),
    ("rs", "rs"),
    ("javascript", "js"),
    ("js", "js"),
    ("typescript", "ts"),
    ("ts", "ts"),
    ("java", "java"),
    ("go", "go"),
    ("c", "c"),
    ("cpp", "cpp"),
    ("c++", "cpp"),
    ("ruby", "rb"),
    ("php", "php"),
    ("swift", "swift"),
    ("kotlin", "kt"),
    ("scala", "scala"),
    ("sql", "sql"),
    ("html", "html"),
    ("css", "css"),
    ("json", "json"),
    ("yaml", "yaml"),
    ("yml", "yml"),
    ("toml", "toml"),
    ("xml", "xml"),
    ("markdown", "md"),
    ("md", "md"),
    ("bash", "sh"),
    ("sh", "sh"),
    ("shell", "sh"),
    ("dockerfile", "dockerfile"),
    ("makefile", "mk"),
    ("txt", "txt"),
    ("text", "txt"),
    ("plaintext", "txt"),
];

/// A file extracted from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub path: String,
    pub content: String,
}

/// Extract every non-empty fenced block from `response`.
pub fn parse_code_blocks(response: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    for caps in FENCE_RE.captures_iter(response) {
        let header = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if body.trim().is_empty() {
            continue;
        }
        let (path, content) = resolve_path(header, body, blocks.len());
        blocks.push(CodeBlock { path, content });
    }
    blocks
}

fn resolve_path(header: &str, body: &str, index: usize) -> (String, String) {
    let content = format!("{}\n", body.trim_end());

    if let Some(rest) = strip_prefix_ignore_case(header, "file:") {
        let rest = rest.trim();
        if !rest.is_empty() {
            return (rest.to_string(), content);
        }
    }

    let tag = language_extension(header);
    if tag.is_none() && looks_like_path(header) {
        return (header.to_string(), content);
    }

    if let Some(first) = body.lines().find(|l| !l.trim().is_empty()) {
        if let Some(caps) = HINT_RE.captures(first) {
            let hinted = caps[1].trim_matches(|c| c == '"' || c == '\'' || c == '`');
            if !hinted.is_empty() {
                let rest: String = body
                    .lines()
                    .skip_while(|l| l.trim().is_empty())
                    .skip(1)
                    .collect::<Vec<_>>()
                    .join("\n");
                let rest = format!("{}\n", rest.trim_end());
                return (hinted.to_string(), rest);
            }
        }
    }

    let ext = tag.unwrap_or("txt");
    (format!("generated_{index}.{ext}"), content)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

fn language_extension(header: &str) -> Option<&'static str> {
    let lower = header.to_ascii_lowercase();
    LANGUAGE_TAGS
        .iter()
        .find(|(tag, _)| *tag == lower)
        .map(|(_, ext)| *ext)
}

fn looks_like_path(header: &str) -> bool {
    if header.is_empty() {
        return false;
    }
    if header.contains('/') || header.contains('\\') {
        return true;
    }
    match header.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && !ext.is_empty() && ext.len() <= 5,
        None => false,
    }
}

/// Validate a model-supplied path and make it relative to the project root.
///
/// Rejects absolute paths, parent traversal and paths into `.git`.
pub fn safe_relative_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.trim().replace('\\', "/");
    let path = Path::new(&normalized);
    if normalized.is_empty() || path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                if out.as_os_str().is_empty() && part == ".git" {
                    return None;
                }
                out.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_path_is_used() {
        let blocks = parse_code_blocks("```src/main.rs\nfn main() {}\n```\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].path, "src/main.rs");
        assert_eq!(blocks[0].content, "fn main() {}\n");
    }

    #[test]
    fn file_marker_and_spaces() {
        let blocks = parse_code_blocks(
            "```file: src/lib.rs\npub fn a() {}\n```\n```src/my file.py\nprint(1)\n```",
        );
        let paths: Vec<&str> = blocks.iter().map(|b| b.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs", "src/my file.py"]);
    }

    #[test]
    fn language_tag_falls_back_to_generated_name() {
        let blocks = parse_code_blocks("```python\ndef main():\n    pass\n```");
        assert_eq!(blocks[0].path, "generated_0.py");
    }

    #[test]
    fn comment_hint_names_the_file_and_is_stripped() {
        let blocks = parse_code_blocks("```rust\n// file: src/util.rs\npub fn util() {}\n```");
        assert_eq!(blocks[0].path, "src/util.rs");
        assert_eq!(blocks[0].content, "pub fn util() {}\n");
    }

    #[test]
    fn empty_blocks_are_skipped_and_indices_stay_dense() {
        let blocks = parse_code_blocks("```python\n\n```\n```\nplain\n```");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].path, "generated_0.txt");
    }

    #[test]
    fn no_blocks() {
        assert!(parse_code_blocks("just prose").is_empty());
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        assert_eq!(safe_relative_path("./src/a.rs"), Some(PathBuf::from("src/a.rs")));
        assert!(safe_relative_path("/etc/passwd").is_none());
        assert!(safe_relative_path("../outside.rs").is_none());
        assert!(safe_relative_path("src/../../x").is_none());
        assert!(safe_relative_path(".git/config").is_none());
        assert!(safe_relative_path("  ").is_none());
    }
}
