use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const BUILTIN_SYSTEM_PROMPT: &str = "You are an expert web developer who builds realistic, self-contained test websites.

Generate complete, functional static websites using HTML5, CSS3 and vanilla JavaScript:
- realistic content, listings and navigation for the requested kind of site
- professional styling and a responsive layout
- no external build steps, frameworks or CDNs; every asset is a local file
- relative links between pages and assets so the site works from any local port

Return every file in its own fenced code block and put the relative file path in the
code fence info string, for example ```html index.html. Always include index.html.";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template '{name}' not found in {}", dir.display())]
    NotFound { name: String, dir: PathBuf },
    #[error("malformed prompt template {}: {reason}", path.display())]
    MalformedTemplate { path: PathBuf, reason: String },
    #[error("failed reading prompt template {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    pub variables: BTreeMap<String, JsonValue>,
    pub metadata: BTreeMap<String, JsonValue>,
}

/// Lookup order when one name exists in several formats.
const TEMPLATE_EXTENSIONS: [&str; 4] = ["json", "yaml", "yml", "txt"];

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "template")]
    system_prompt: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, JsonValue>,
    #[serde(default)]
    metadata: BTreeMap<String, JsonValue>,
}

impl PromptTemplate {
    pub fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: Some("Built-in website generation prompt".to_string()),
            system_prompt: BUILTIN_SYSTEM_PROMPT.to_string(),
            variables: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Substitutes `{name}` placeholders from the template defaults merged with `overrides`.
    /// Unknown placeholders are kept verbatim; `{{` and `}}` produce literal braces.
    pub fn render(&self, overrides: &BTreeMap<String, String>) -> String {
        let lookup = |key: &str| -> Option<String> {
            if let Some(value) = overrides.get(key) {
                return Some(value.clone());
            }
            self.variables.get(key).map(|value| match value {
                JsonValue::String(text) => text.clone(),
                other => other.to_string(),
            })
        };

        let source = &self.system_prompt;
        let mut out = String::with_capacity(source.len());
        let mut rest = source.as_str();

        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("{{") {
                out.push('{');
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with("}}") {
                out.push('}');
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('{') {
                if let Some(end) = tail.find('}') {
                    let key = &tail[1..end];
                    if is_placeholder(key) {
                        if let Some(value) = lookup(key) {
                            out.push_str(&value);
                            rest = &tail[end + 1..];
                            continue;
                        }
                    }
                }
            }

            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
        out.push_str(rest);
        out
    }
}

fn is_placeholder(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn builtin_system_prompt() -> &'static str {
    BUILTIN_SYSTEM_PROMPT
}

#[derive(Debug, Clone)]
pub struct PromptStore {
    dir: PathBuf,
}

impl PromptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads `<name>.json`, `.yaml`, `.yml` or `.txt`, first match in that order.
    pub fn load(&self, name: &str) -> Result<PromptTemplate, PromptError> {
        if !is_valid_name(name) {
            return Err(self.not_found(name));
        }

        let Some(path) = TEMPLATE_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|path| path.is_file())
        else {
            return Err(self.not_found(name));
        };
        let raw = fs::read_to_string(&path).map_err(|source| PromptError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(template = name, path = %path.display(), "loading prompt template");

        let parsed = parse_template_file(&path, &raw)?;
        let system_prompt = parsed
            .system_prompt
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| PromptError::MalformedTemplate {
                path: path.clone(),
                reason: "missing system_prompt text".to_string(),
            })?;

        Ok(PromptTemplate {
            name: name.to_string(),
            description: parsed.description,
            system_prompt,
            variables: parsed.variables,
            metadata: parsed.metadata,
        })
    }

    pub fn list(&self) -> Result<Vec<String>, PromptError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PromptError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry in {}: {err}", self.dir.display());
                    continue;
                }
            };
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| TEMPLATE_EXTENSIONS.contains(&ext));
            if !supported || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn not_found(&self, name: &str) -> PromptError {
        PromptError::NotFound {
            name: name.to_string(),
            dir: self.dir.clone(),
        }
    }
}

fn parse_template_file(path: &Path, raw: &str) -> Result<TemplateFile, PromptError> {
    let malformed = |reason: String| PromptError::MalformedTemplate {
        path: path.to_path_buf(),
        reason,
    };
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(raw).map_err(|err| malformed(err.to_string())),
        Some("txt") => Ok(TemplateFile {
            description: path
                .file_name()
                .map(|file| format!("Prompt from {}", file.to_string_lossy())),
            system_prompt: Some(raw.trim().to_string()),
            variables: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }),
        _ => serde_json::from_str(raw).map_err(|err| malformed(err.to_string())),
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::{PromptError, PromptStore, PromptTemplate, builtin_system_prompt};
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_template_by_name() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(
            dir.path().join("shop.json"),
            r#"{"name":"shop","description":"storefront","system_prompt":"Build shops.","metadata":{"use":"ecommerce"}}"#,
        )
        .expect("write should work");

        let store = PromptStore::new(dir.path());
        let template = store.load("shop").expect("load should work");
        assert_eq!(template.name, "shop");
        assert_eq!(template.system_prompt, "Build shops.");
        assert_eq!(template.description.as_deref(), Some("storefront"));
        assert_eq!(template.metadata["use"], "ecommerce");
    }

    #[test]
    fn template_key_is_accepted_as_system_prompt() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(dir.path().join("legacy.json"), r#"{"template":"Old style."}"#)
            .expect("write should work");

        let template = PromptStore::new(dir.path())
            .load("legacy")
            .expect("load should work");
        assert_eq!(template.system_prompt, "Old style.");
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().expect("tempdir should work");
        let err = PromptStore::new(dir.path())
            .load("absent")
            .expect_err("must fail");
        assert!(matches!(err, PromptError::NotFound { ref name, .. } if name == "absent"));
    }

    #[test]
    fn traversal_names_are_not_found() {
        let dir = tempdir().expect("tempdir should work");
        let err = PromptStore::new(dir.path().join("prompts"))
            .load("../secrets")
            .expect_err("must fail");
        assert!(matches!(err, PromptError::NotFound { .. }));
    }

    #[test]
    fn missing_system_prompt_is_malformed() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(dir.path().join("empty.json"), r#"{"description":"nothing"}"#)
            .expect("write should work");
        fs::write(dir.path().join("blank.json"), r#"{"system_prompt":"   "}"#)
            .expect("write should work");

        let store = PromptStore::new(dir.path());
        for name in ["empty", "blank"] {
            let err = store.load(name).expect_err("must fail");
            assert!(matches!(err, PromptError::MalformedTemplate { .. }), "{name}: {err}");
        }
    }

    #[test]
    fn invalid_json_is_malformed() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(dir.path().join("broken.json"), "{ nope").expect("write should work");

        let err = PromptStore::new(dir.path())
            .load("broken")
            .expect_err("must fail");
        assert!(err.to_string().contains("malformed prompt template"));
    }

    #[test]
    fn list_returns_sorted_unique_stems() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(dir.path().join("zeta.json"), "{}").expect("write should work");
        fs::write(dir.path().join("alpha.json"), "{}").expect("write should work");
        fs::write(dir.path().join("alpha.txt"), "x").expect("write should work");
        fs::write(dir.path().join("notes.txt"), "x").expect("write should work");
        fs::write(dir.path().join("blog.yml"), "x: 1").expect("write should work");
        fs::write(dir.path().join("README.md"), "ignored").expect("write should work");

        let names = PromptStore::new(dir.path()).list().expect("list should work");
        assert_eq!(names, vec!["alpha", "blog", "notes", "zeta"]);
    }

    #[test]
    fn text_template_body_is_the_system_prompt() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(
            dir.path().join("forum.txt"),
            "\nBuild a {kind} forum with threads.\n\n",
        )
        .expect("write should work");

        let template = PromptStore::new(dir.path())
            .load("forum")
            .expect("load should work");
        assert_eq!(template.system_prompt, "Build a {kind} forum with threads.");
        assert_eq!(template.description.as_deref(), Some("Prompt from forum.txt"));
        assert!(template.variables.is_empty());

        fs::write(dir.path().join("blank.txt"), "  \n").expect("write should work");
        let err = PromptStore::new(dir.path())
            .load("blank")
            .expect_err("must fail");
        assert!(matches!(err, PromptError::MalformedTemplate { .. }));
    }

    #[test]
    fn yaml_templates_load_with_variables() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(
            dir.path().join("news.yaml"),
            "description: newsroom\ntemplate: |\n  Build a {tone} news site.\nvariables:\n  tone: sober\n",
        )
        .expect("write should work");

        let template = PromptStore::new(dir.path())
            .load("news")
            .expect("load should work");
        assert_eq!(template.description.as_deref(), Some("newsroom"));
        assert_eq!(template.render(&BTreeMap::new()), "Build a sober news site.\n");

        fs::write(dir.path().join("bad.yml"), "template: [unclosed").expect("write should work");
        let err = PromptStore::new(dir.path())
            .load("bad")
            .expect_err("must fail");
        assert!(matches!(err, PromptError::MalformedTemplate { .. }));
    }

    #[test]
    fn json_wins_when_a_name_has_several_formats() {
        let dir = tempdir().expect("tempdir should work");
        fs::write(dir.path().join("shop.txt"), "From text.").expect("write should work");
        fs::write(dir.path().join("shop.json"), r#"{"system_prompt":"From json."}"#)
            .expect("write should work");

        let template = PromptStore::new(dir.path())
            .load("shop")
            .expect("load should work");
        assert_eq!(template.system_prompt, "From json.");
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let dir = tempdir().expect("tempdir should work");
        let names = PromptStore::new(dir.path().join("nope"))
            .list()
            .expect("list should work");
        assert!(names.is_empty());
    }

    #[test]
    fn render_substitutes_defaults_and_overrides() {
        let mut template = PromptTemplate::builtin("t");
        template.system_prompt =
            "Build a {style} {kind} site with {pages} pages {unknown} {{raw}}".to_string();
        template
            .variables
            .insert("style".to_string(), serde_json::json!("modern"));
        template
            .variables
            .insert("pages".to_string(), serde_json::json!(4));

        let mut overrides = BTreeMap::new();
        overrides.insert("kind".to_string(), "bookstore".to_string());

        assert_eq!(
            template.render(&overrides),
            "Build a modern bookstore site with 4 pages {unknown} {raw}"
        );
    }

    #[test]
    fn builtin_prompt_asks_for_labeled_fences() {
        assert!(builtin_system_prompt().contains("index.html"));
        assert_eq!(
            PromptTemplate::builtin("website_generator").system_prompt,
            builtin_system_prompt()
        );
    }
}
