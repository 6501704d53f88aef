use thiserror::Error;
use tracing::debug;

const TEXT_EXTENSIONS: &[&str] = &[
    "html",
    "htm",
    "css",
    "js",
    "mjs",
    "json",
    "xml",
    "txt",
    "svg",
    "md",
    "csv",
    "webmanifest",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Files recovered from a model response, in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedFileSet {
    files: Vec<GeneratedFile>,
}

impl GeneratedFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a file; a repeated path keeps its position and takes the new content.
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        let path = path.into();
        let content = content.into();
        match self.files.iter_mut().find(|file| file.path == path) {
            Some(existing) => existing.content = content,
            None => self.files.push(GeneratedFile { path, content }),
        }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|file| file.path == path)
            .map(|file| file.content.as_str())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeneratedFile> {
        self.files.iter()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|file| file.path.clone()).collect()
    }

    pub fn entry_page(&self) -> Option<&str> {
        choose_entry_page(self.files.iter().map(|file| file.path.as_str()))
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for GeneratedFileSet {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (path, content) in iter {
            set.insert(path, content);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("no files found in model response")]
    NoFilesFound,
    #[error("model response has no HTML entry page (found: {})", .0.join(", "))]
    MissingHtmlEntry(Vec<String>),
}

/// `index.html` when present, otherwise the first HTML page in order.
pub fn choose_entry_page<'a>(paths: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut first_html = None;
    for path in paths {
        if path == "index.html" {
            return Some(path);
        }
        if first_html.is_none() && is_html_path(path) {
            first_html = Some(path);
        }
    }
    first_html
}

fn is_html_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

/// Normalizes a model-supplied path to a safe relative path, or rejects it.
pub fn normalize_file_path(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .replace('\\', "/");

    let mut segments = Vec::new();
    for segment in cleaned.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            other => segments.push(other),
        }
    }

    let first = segments.first()?;
    if first.contains(':') {
        return None;
    }
    Some(segments.join("/"))
}

fn looks_like_file_name(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.chars().any(char::is_whitespace) {
        return false;
    }
    if !candidate
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | '\\'))
    {
        return false;
    }
    candidate
        .rsplit_once('.')
        .map(|(stem, ext)| {
            !stem.is_empty() && TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
        })
        .unwrap_or(false)
}

fn strip_wrapping<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    text.strip_prefix(open)?.strip_suffix(close).map(str::trim)
}

fn strip_emphasis(text: &str) -> &str {
    let mut current = text.trim();
    loop {
        let next = current
            .trim_end_matches(':')
            .trim()
            .trim_matches(|c| c == '*' || c == '_' || c == '`')
            .trim();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Recognizes a line that names the file whose content follows, for example
/// `--- index.html ---`, `<!-- File: index.html -->`, `### style.css` or `**script.js**`.
fn parse_label_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() > 200 {
        return None;
    }

    let mut body = trimmed;
    let mut wrapped = false;

    if let Some(inner) = strip_wrapping(body, "<!--", "-->") {
        body = inner;
        wrapped = true;
    } else if let Some(inner) = strip_wrapping(body, "/*", "*/") {
        body = inner;
        wrapped = true;
    } else if let Some(inner) = body.strip_prefix("//") {
        body = inner.trim();
        wrapped = true;
    } else if body.starts_with("---") || body.starts_with("===") {
        body = body.trim_matches(|c| c == '-' || c == '=').trim();
        wrapped = true;
    } else if body.starts_with('#') {
        body = body.trim_start_matches('#').trim();
        wrapped = true;
    }

    let emphasised = strip_emphasis(body);
    wrapped |= emphasised.len() != body.len();
    body = emphasised;

    let lower = body.to_ascii_lowercase();
    for prefix in ["filename:", "file name:", "file:", "path:"] {
        if lower.starts_with(prefix) {
            body = strip_emphasis(&body[prefix.len()..]);
            wrapped = true;
            break;
        }
    }

    if !wrapped && trimmed.ends_with(':') {
        wrapped = true;
    }
    let bare_line = body.len() == trimmed.len();
    if (wrapped || bare_line) && looks_like_file_name(body) {
        return normalize_file_path(body);
    }
    None
}

fn fence_opener(line: &str) -> Option<(&'static str, &str)> {
    let trimmed = line.trim_start();
    for fence in ["```", "~~~"] {
        if let Some(info) = trimmed.strip_prefix(fence) {
            return Some((fence, info.trim_start_matches(fence.chars().next().unwrap_or('`'))));
        }
    }
    None
}

fn is_fence_closer(line: &str, fence: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with(fence) && trimmed.trim_start_matches(&fence[..1]).trim().is_empty()
}

#[derive(Debug, Default)]
struct FenceInfo {
    lang: Option<String>,
    name: Option<String>,
    rejected_path: bool,
}

/// Splits a fence info string into language and file name.
fn parse_fence_info(info: &str) -> FenceInfo {
    let mut lang = None;
    let mut name = None;
    let mut rejected_path = false;
    let mut accept = |candidate: &str, name: &mut Option<String>| {
        if name.is_some() {
            return;
        }
        match normalize_file_path(candidate) {
            Some(path) => *name = Some(path),
            None => rejected_path = true,
        }
    };

    for (index, raw_token) in info
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .enumerate()
    {
        let mut token = raw_token;
        for key in ["title=", "filename=", "file=", "name=", "path="] {
            if let Some(rest) = token.strip_prefix(key) {
                token = rest;
                break;
            }
        }
        let token = token.trim_matches(|c| c == '"' || c == '\'' || c == '{' || c == '}');

        let (head, tail) = match token.split_once(':') {
            Some((head, tail)) if !tail.is_empty() => (head, Some(tail)),
            _ => (token, None),
        };

        if let Some(tail) = tail.filter(|t| looks_like_file_name(t)) {
            if index == 0 {
                lang = Some(head.to_ascii_lowercase());
            }
            accept(tail, &mut name);
            continue;
        }
        if looks_like_file_name(token) {
            accept(token, &mut name);
            continue;
        }
        if index == 0 {
            lang = Some(token.to_ascii_lowercase());
        }
    }

    FenceInfo {
        lang,
        rejected_path: rejected_path && name.is_none(),
        name,
    }
}

fn default_name_for(lang: Option<&str>, body: &str) -> Option<&'static str> {
    match lang {
        Some("html" | "htm" | "xhtml") => Some("index.html"),
        Some("css") => Some("style.css"),
        Some("js" | "javascript" | "mjs") => Some("script.js"),
        Some("json") => Some("data.json"),
        Some(_) => None,
        None => {
            let head = body.trim_start().to_ascii_lowercase();
            if head.starts_with("<!doctype html") || head.starts_with("<html") {
                Some("index.html")
            } else {
                None
            }
        }
    }
}

fn finish_section(lines: &[&str]) -> Option<String> {
    let start = lines.iter().position(|l| !l.trim().is_empty())?;
    let end = lines.iter().rposition(|l| !l.trim().is_empty())?;
    let mut content = lines[start..=end].join("\n");
    content.push('\n');
    Some(content)
}

struct Section<'a> {
    name: String,
    lines: Vec<&'a str>,
}

fn flush_section(section: Option<Section<'_>>, files: &mut GeneratedFileSet) {
    if let Some(section) = section {
        if let Some(content) = finish_section(&section.lines) {
            files.insert(section.name, content);
        }
    }
}

fn extract_bare_html(raw: &str) -> Option<String> {
    let lower = raw.to_ascii_lowercase();
    let start = lower.find("<!doctype html").or_else(|| lower.find("<html"))?;
    let end = lower
        .rfind("</html>")
        .map(|pos| pos + "</html>".len())
        .filter(|end| *end > start)
        .unwrap_or(raw.len());
    let mut content = raw[start..end].trim_end().to_string();
    content.push('\n');
    Some(content)
}

/// Best-effort extraction of named files from free-form model output.
pub fn parse_files(raw: &str) -> Result<GeneratedFileSet, ParseFailure> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut files = GeneratedFileSet::new();
    let mut unlabeled: Vec<(Option<String>, String)> = Vec::new();
    let mut section: Option<Section<'_>> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some((fence, info)) = fence_opener(line) {
            let mut body = Vec::new();
            i += 1;
            while i < lines.len() && !is_fence_closer(lines[i], fence) {
                body.push(lines[i]);
                i += 1;
            }
            i += 1;

            let mut content = body.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            let info = parse_fence_info(info);
            if info.rejected_path {
                flush_section(section.take(), &mut files);
                debug!("skipping block with unsafe file path");
                continue;
            }
            let lang = info.lang;

            let name = match (info.name, section.take()) {
                (Some(name), open) => {
                    flush_section(open, &mut files);
                    Some(name)
                }
                (None, Some(open)) if open.lines.iter().all(|l| l.trim().is_empty()) => {
                    Some(open.name)
                }
                (None, open) => {
                    flush_section(open, &mut files);
                    None
                }
            };

            match name {
                Some(name) if !content.trim().is_empty() => files.insert(name, content),
                Some(name) => debug!("skipping empty block for {name}"),
                None if !content.trim().is_empty() => unlabeled.push((lang, content)),
                None => {}
            }
            continue;
        }

        if let Some(name) = parse_label_line(line) {
            flush_section(section.take(), &mut files);
            section = Some(Section {
                name,
                lines: Vec::new(),
            });
        } else if let Some(open) = section.as_mut() {
            open.lines.push(line);
        }
        i += 1;
    }
    flush_section(section, &mut files);

    for (lang, content) in unlabeled {
        match default_name_for(lang.as_deref(), &content) {
            Some(name) if !files.contains(name) => files.insert(name, content),
            Some(name) => debug!("ignoring unlabeled block, {name} already present"),
            None => debug!("ignoring unlabeled block with language {lang:?}"),
        }
    }

    if files.is_empty() {
        if let Some(html) = extract_bare_html(raw) {
            files.insert("index.html", html);
        }
    }

    if files.is_empty() {
        return Err(ParseFailure::NoFilesFound);
    }
    if files.entry_page().is_none() {
        return Err(ParseFailure::MissingHtmlEntry(files.paths()));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::{GeneratedFileSet, ParseFailure, normalize_file_path, parse_files};

    #[test]
    fn fenced_blocks_with_file_names_in_info_string() {
        let raw = "Here is your site.\n\n```html index.html\n<!DOCTYPE html>\n<h1>Books</h1>\n```\n\nAnd styles:\n```css title=\"css/style.css\"\nbody { margin: 0; }\n```\n```javascript:script.js\nconsole.log('hi');\n```\nEnjoy!";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(files.paths(), vec!["index.html", "css/style.css", "script.js"]);
        assert_eq!(files.get("index.html"), Some("<!DOCTYPE html>\n<h1>Books</h1>\n"));
        assert_eq!(files.get("css/style.css"), Some("body { margin: 0; }\n"));
        assert_eq!(files.get("script.js"), Some("console.log('hi');\n"));
    }

    #[test]
    fn labels_on_preceding_line_name_the_fence() {
        let raw = "**index.html**\n```html\n<html></html>\n```\n\n### `about.html`:\n\n```html\n<p>about</p>\n```\n\nFile: js/app.js\n```js\nrun();\n```";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(files.paths(), vec!["index.html", "about.html", "js/app.js"]);
        assert_eq!(files.get("about.html"), Some("<p>about</p>\n"));
    }

    #[test]
    fn dashed_and_comment_markers_delimit_unfenced_content() {
        let raw = "--- index.html ---\n<html>\n<body>hi</body>\n</html>\n\n<!-- File: products.html -->\n<ul></ul>\n/* File: style.css */\nbody {}\n// File: script.js\nalert(1);\n";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(
            files.paths(),
            vec!["index.html", "products.html", "style.css", "script.js"]
        );
        assert_eq!(
            files.get("index.html"),
            Some("<html>\n<body>hi</body>\n</html>\n")
        );
        assert_eq!(files.get("script.js"), Some("alert(1);\n"));
    }

    #[test]
    fn markers_followed_by_fences_use_fence_body() {
        let raw = "=== index.html ===\n\n```html\n<main></main>\n```\n=== robots.txt ===\n```\nUser-agent: *\nDisallow: /admin\n```\n";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(files.get("index.html"), Some("<main></main>\n"));
        assert_eq!(
            files.get("robots.txt"),
            Some("User-agent: *\nDisallow: /admin\n")
        );
    }

    #[test]
    fn unlabeled_fences_get_default_names() {
        let raw = "```html\n<!DOCTYPE html><title>x</title>\n```\n```css\nh1 {}\n```\n```js\nmain();\n```\n```python\nprint('ignored')\n```";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(files.paths(), vec!["index.html", "style.css", "script.js"]);
    }

    #[test]
    fn unlabeled_fence_does_not_override_labeled_file() {
        let raw = "```html index.html\n<p>real</p>\n```\n```html\n<p>snippet</p>\n```";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(files.len(), 1);
        assert_eq!(files.get("index.html"), Some("<p>real</p>\n"));
    }

    #[test]
    fn bare_html_document_becomes_index() {
        let raw = "Sure! <!DOCTYPE html>\n<html><body>shop</body></html>\nHope this helps.";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(
            files.get("index.html"),
            Some("<!DOCTYPE html>\n<html><body>shop</body></html>\n")
        );
    }

    #[test]
    fn prose_only_response_has_no_files() {
        let err = parse_files("I cannot help with that request.").expect_err("must fail");
        assert_eq!(err, ParseFailure::NoFilesFound);
    }

    #[test]
    fn files_without_html_entry_fail() {
        let err = parse_files("```css style.css\nbody {}\n```").expect_err("must fail");
        assert_eq!(err, ParseFailure::MissingHtmlEntry(vec!["style.css".to_string()]));
    }

    #[test]
    fn traversal_paths_are_skipped() {
        let raw = "```html ../../etc/evil.html\n<p>x</p>\n```\n```html ./pages/index.html\n<p>ok</p>\n```";
        let files = parse_files(raw).expect("parse should work");

        assert_eq!(files.paths(), vec!["pages/index.html"]);
        assert_eq!(files.entry_page(), Some("pages/index.html"));
    }

    #[test]
    fn prose_mentioning_file_names_is_not_a_label() {
        let raw = "Open index.html in a browser to see the result.\n```html index.html\n<p>x</p>\n```";
        let files = parse_files(raw).expect("parse should work");
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn unclosed_fence_keeps_truncated_content() {
        let raw = "```html index.html\n<html>\n<body>";
        let files = parse_files(raw).expect("parse should work");
        assert_eq!(files.get("index.html"), Some("<html>\n<body>\n"));
    }

    #[test]
    fn normalize_rejects_escapes_and_drive_prefixes() {
        assert_eq!(normalize_file_path("./a/b.css"), Some("a/b.css".to_string()));
        assert_eq!(normalize_file_path("/abs/x.js"), Some("abs/x.js".to_string()));
        assert_eq!(normalize_file_path("a\\b.html"), Some("a/b.html".to_string()));
        assert_eq!(normalize_file_path("../x.html"), None);
        assert_eq!(normalize_file_path("C:/x.html"), None);
        assert_eq!(normalize_file_path(""), None);
    }

    #[test]
    fn entry_page_prefers_index() {
        let set: GeneratedFileSet = [("about.html", "a"), ("index.html", "b")]
            .into_iter()
            .collect();
        assert_eq!(set.entry_page(), Some("index.html"));

        let set: GeneratedFileSet = [("style.css", "a"), ("home.htm", "b")].into_iter().collect();
        assert_eq!(set.entry_page(), Some("home.htm"));
    }

    #[test]
    fn repeated_path_keeps_position_and_takes_latest_content() {
        let mut set = GeneratedFileSet::new();
        set.insert("index.html", "v1");
        set.insert("style.css", "s");
        set.insert("index.html", "v2");
        assert_eq!(set.paths(), vec!["index.html", "style.css"]);
        assert_eq!(set.get("index.html"), Some("v2"));
    }
}
