//! Local file tools confined to a home directory
//!
//! Paths are resolved relative to the home directory, normalized lexically
//! and then canonicalized, so neither `..` nor symlinks can escape it.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use regex::RegexBuilder;
use scraper::Html;
use serde_json::{json, Value};

use crate::error::ToolError;

use super::web::{clip_chars, extract_links, tidy_text, visible_text};

/// Files larger than this are refused
pub const MAX_FILE_BYTES: u64 = 25 * 1024 * 1024;

/// Bytes read per file when matching `contains`
const CONTENT_SCAN_BYTES: u64 = 200_000;

const CONTENT_SCAN_EXTS: &[&str] = &[
    "txt", "md", "markdown", "json", "csv", "py", "html", "htm", "log",
];

/// Filters for `search_files`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileQuery {
    /// Substring (or regex) matched against the file name
    pub name: Option<String>,
    pub ext: Option<String>,
    /// Substring searched in text-like files
    pub contains: Option<String>,
    pub case_sensitive: bool,
    pub regex: bool,
    pub max_results: usize,
}

/// Resolve `requested` under `home`, rejecting anything outside it
pub fn resolve_under_home(home: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let home = home
        .canonicalize()
        .map_err(|e| ToolError::failed(format!("home directory {} unavailable: {}", home.display(), e)))?;

    let requested = Path::new(requested.trim());
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        home.join(requested)
    };

    let normalized = joined.components().fold(PathBuf::new(), |mut acc, comp| {
        match comp {
            Component::ParentDir => {
                acc.pop();
            }
            Component::CurDir => {}
            other => acc.push(other.as_os_str()),
        }
        acc
    });

    // Follow symlinks when the target exists
    let resolved = normalized.canonicalize().unwrap_or(normalized);
    if !resolved.starts_with(&home) {
        return Err(ToolError::invalid(format!(
            "path {} is outside of the home directory {}",
            resolved.display(),
            home.display()
        )));
    }
    Ok(resolved)
}

fn file_meta(path: &Path, meta: &fs::Metadata) -> Value {
    let modified = meta
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
    json!({
        "path": path.display().to_string(),
        "size_bytes": meta.len(),
        "modified": modified,
    })
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Load a text, markdown or HTML file
pub fn load_file(home: &Path, path: &str, max_chars: usize) -> Result<Value, ToolError> {
    let abs = resolve_under_home(home, path)?;
    let meta = fs::metadata(&abs)
        .map_err(|_| ToolError::failed(format!("file not found: {}", abs.display())))?;
    if !meta.is_file() {
        return Err(ToolError::failed(format!("not a regular file: {}", abs.display())));
    }
    if meta.len() > MAX_FILE_BYTES {
        return Err(ToolError::failed(format!(
            "file too large: {} bytes (limit {} bytes)",
            meta.len(),
            MAX_FILE_BYTES
        )));
    }

    let ext = extension(&abs);
    if ext == "pdf" {
        return Err(ToolError::failed("PDF extraction is not supported; convert the file to text first"));
    }

    let data = fs::read(&abs).map_err(|e| ToolError::failed(format!("failed to read file: {}", e)))?;
    let text = String::from_utf8_lossy(&data);
    let file_name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Untitled".to_string());

    if matches!(ext.as_str(), "html" | "htm" | "xhtml") {
        let doc = Html::parse_document(&text);
        let title = scraper::Selector::parse("title")
            .ok()
            .and_then(|sel| doc.select(&sel).next().map(|t| t.text().collect::<String>()))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| file_name.clone());
        let base = format!("file://{}", abs.display());
        return Ok(json!({
            "kind": "html",
            "title": title,
            "content": clip_chars(&visible_text(&doc), max_chars),
            "links": extract_links(&doc, &base),
            "meta": file_meta(&abs, &meta),
        }));
    }

    Ok(json!({
        "kind": "text",
        "title": file_name,
        "content": clip_chars(&tidy_text(&text), max_chars),
        "links": [],
        "meta": file_meta(&abs, &meta),
    }))
}

/// Walk the home directory and return files matching every given filter
pub fn search_files(home: &Path, query: &FileQuery) -> Result<Value, ToolError> {
    if !home.is_dir() {
        return Err(ToolError::failed(format!("home directory not found: {}", home.display())));
    }

    let name_re = match &query.name {
        Some(name) => {
            let pattern = if query.regex { name.clone() } else { regex::escape(name) };
            Some(
                RegexBuilder::new(&pattern)
                    .case_insensitive(!query.case_sensitive)
                    .build()
                    .map_err(|e| ToolError::invalid(format!("invalid name pattern: {}", e)))?,
            )
        }
        None => None,
    };
    let ext = query
        .ext
        .as_deref()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty());
    let needle = query.contains.as_deref().filter(|c| !c.is_empty()).map(|c| {
        if query.case_sensitive {
            c.to_string()
        } else {
            c.to_lowercase()
        }
    });

    let mut results = Vec::new();
    let mut scanned = 0usize;

    for entry in WalkBuilder::new(home).hidden(false).git_ignore(false).build() {
        if results.len() >= query.max_results {
            break;
        }
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        scanned += 1;

        let file_name = entry.file_name().to_string_lossy();
        if let Some(re) = &name_re {
            if !re.is_match(&file_name) {
                continue;
            }
        }
        let file_ext = extension(path);
        if let Some(ext) = &ext {
            if &file_ext != ext {
                continue;
            }
        }
        if let Some(needle) = &needle {
            if !CONTENT_SCAN_EXTS.contains(&file_ext.as_str())
                || !file_contains(path, needle, query.case_sensitive)
            {
                continue;
            }
        }

        if let Ok(meta) = entry.metadata() {
            results.push(file_meta(path, &meta));
        }
    }

    Ok(json!({
        "home": home.display().to_string(),
        "results": results,
        "scanned": scanned,
    }))
}

fn file_contains(path: &Path, needle: &str, case_sensitive: bool) -> bool {
    let Ok(file) = fs::File::open(path) else {
        return false;
    };
    let mut buf = Vec::new();
    if file.take(CONTENT_SCAN_BYTES).read_to_end(&mut buf).is_err() {
        return false;
    }
    let text = String::from_utf8_lossy(&buf);
    if case_sensitive {
        text.contains(needle)
    } else {
        text.to_lowercase().contains(needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolErrorKind;

    fn home() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.md"), "# Notes\n\nThe Quick brown fox.\n").unwrap();
        fs::write(dir.path().join("data.csv"), "a,b\n1,2\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(
            dir.path().join("sub/page.html"),
            "<html><head><title>Page</title></head><body><p>fox body</p><a href='other.html'>o</a></body></html>",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_load_text_file() {
        let dir = home();
        let out = load_file(dir.path(), "notes.md", 1000).unwrap();
        assert_eq!(out["kind"], "text");
        assert_eq!(out["title"], "notes.md");
        assert!(out["content"].as_str().unwrap().contains("Quick brown fox"));
    }

    #[test]
    fn test_load_html_file() {
        let dir = home();
        let out = load_file(dir.path(), "sub/page.html", 1000).unwrap();
        assert_eq!(out["kind"], "html");
        assert_eq!(out["title"], "Page");
        assert_eq!(out["content"], "fox body\no");
        assert!(out["links"][0].as_str().unwrap().ends_with("/sub/other.html"));
    }

    #[test]
    fn test_load_file_respects_max_chars() {
        let dir = home();
        let out = load_file(dir.path(), "notes.md", 4).unwrap();
        assert_eq!(out["content"], "# No");
    }

    #[test]
    fn test_escape_rejected() {
        let dir = home();
        let err = load_file(dir.path(), "../../etc/passwd", 100).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::ArgumentInvalid);
        let err = load_file(dir.path(), "/etc/hostname", 100).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::ArgumentInvalid);
    }

    #[test]
    fn test_missing_file() {
        let dir = home();
        let err = load_file(dir.path(), "nope.txt", 100).unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Failed);
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_search_by_extension_and_content() {
        let dir = home();
        let out = search_files(
            dir.path(),
            &FileQuery {
                contains: Some("FOX".into()),
                max_results: 10,
                ..FileQuery::default()
            },
        )
        .unwrap();
        assert_eq!(out["results"].as_array().unwrap().len(), 2);

        let out = search_files(
            dir.path(),
            &FileQuery {
                ext: Some(".CSV".into()),
                max_results: 10,
                ..FileQuery::default()
            },
        )
        .unwrap();
        let results = out["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0]["path"].as_str().unwrap().ends_with("data.csv"));
    }

    #[test]
    fn test_search_by_name_regex() {
        let dir = home();
        let query = FileQuery {
            name: Some(r"^(notes|page)\.".into()),
            regex: true,
            max_results: 10,
            ..FileQuery::default()
        };
        let out = search_files(dir.path(), &query).unwrap();
        assert_eq!(out["results"].as_array().unwrap().len(), 2);

        let bad = FileQuery {
            name: Some("(".into()),
            regex: true,
            max_results: 10,
            ..FileQuery::default()
        };
        assert_eq!(
            search_files(dir.path(), &bad).unwrap_err().kind,
            ToolErrorKind::ArgumentInvalid
        );
    }

    #[test]
    fn test_search_limit() {
        let dir = home();
        let out = search_files(
            dir.path(),
            &FileQuery {
                max_results: 1,
                ..FileQuery::default()
            },
        )
        .unwrap();
        assert_eq!(out["results"].as_array().unwrap().len(), 1);
    }
}
