//! Security validation for tool arguments.
//!
//! Path arguments must be relative, free of `..`, and resolve inside the
//! configured base directory. URL arguments must use http(s) and target an
//! allow-listed origin. The check is lexical: it never touches the
//! filesystem, so a path to a not-yet-existing file still validates.

use std::path::{Component, Path, PathBuf};

use url::Url;

use super::schema::{ParamFormat, ParamSchema};

/// Origin + path allow-lists for tool arguments.
#[derive(Clone, Debug)]
pub struct SecurityPolicy {
    base_directory: PathBuf,
    /// Normalized origins, e.g. `https://example.com` or `http://host:8080`.
    allowed_origins: Vec<String>,
}

impl SecurityPolicy {
    /// `allowed_endpoints` entries that fail to parse as URLs are dropped
    /// with a warning rather than silently allowed.
    pub fn new(base_directory: impl Into<PathBuf>, allowed_endpoints: &[String]) -> Self {
        let allowed_origins = allowed_endpoints
            .iter()
            .filter_map(|e| match Url::parse(e) {
                Ok(url) => Some(origin_of(&url)),
                Err(err) => {
                    tracing::warn!("ignoring unparseable allowed endpoint {e:?}: {err}");
                    None
                }
            })
            .collect();
        Self {
            base_directory: base_directory.into(),
            allowed_origins,
        }
    }

    /// Validates every path/url-formatted argument present in `args`.
    /// Returns the first violation as a message.
    pub fn validate_args(
        &self,
        schema: &ParamSchema,
        args: &serde_json::Value,
    ) -> Result<(), String> {
        let Some(obj) = args.as_object() else {
            return Ok(());
        };
        for name in schema.args_with_format(ParamFormat::Path) {
            if let Some(value) = obj.get(name).and_then(|v| v.as_str()) {
                self.validate_path(value)
                    .map_err(|e| format!("argument {name}: {e}"))?;
            }
        }
        for name in schema.args_with_format(ParamFormat::Url) {
            if let Some(value) = obj.get(name).and_then(|v| v.as_str()) {
                self.validate_url(value)
                    .map_err(|e| format!("argument {name}: {e}"))?;
            }
        }
        Ok(())
    }

    /// Path rule: relative, no `..` components, and the lexical join with the
    /// base directory stays inside it.
    pub fn validate_path(&self, raw: &str) -> Result<(), String> {
        let path = Path::new(raw);
        if path.is_absolute() {
            return Err("absolute paths are not allowed".to_string());
        }
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    return Err("path must not contain '..'".to_string());
                }
                Component::Prefix(_) | Component::RootDir => {
                    return Err("absolute paths are not allowed".to_string());
                }
                Component::Normal(_) | Component::CurDir => {}
            }
        }
        // With '..' rejected, the lexical join cannot escape; this guards the
        // invariant directly in case the rules above ever drift.
        let joined = self.base_directory.join(path);
        if !joined.starts_with(&self.base_directory) {
            return Err("path resolves outside the base directory".to_string());
        }
        Ok(())
    }

    /// URL rule: http(s) scheme and allow-listed origin.
    pub fn validate_url(&self, raw: &str) -> Result<(), String> {
        let url = Url::parse(raw).map_err(|e| format!("invalid url: {e}"))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(format!("scheme {other:?} is not allowed")),
        }
        let origin = origin_of(&url);
        if !self.allowed_origins.iter().any(|o| *o == origin) {
            return Err(format!("origin {origin} is not in the allow-list"));
        }
        Ok(())
    }
}

fn origin_of(url: &Url) -> String {
    match url.port() {
        Some(port) => format!(
            "{}://{}:{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            port
        ),
        None => format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::ParamSpec;
    use serde_json::json;

    fn policy() -> SecurityPolicy {
        SecurityPolicy::new(
            "/srv/agent/workspace",
            &[
                "https://example.com".to_string(),
                "http://localhost:8080".to_string(),
            ],
        )
    }

    #[test]
    fn relative_paths_inside_base_pass() {
        assert!(policy().validate_path("src/main.rs").is_ok());
        assert!(policy().validate_path("./notes/todo.md").is_ok());
    }

    #[test]
    fn traversal_and_absolute_paths_fail() {
        assert!(policy().validate_path("../etc/passwd").is_err());
        assert!(policy().validate_path("src/../../etc/passwd").is_err());
        assert!(policy().validate_path("/etc/passwd").is_err());
    }

    #[test]
    fn urls_must_match_scheme_and_origin() {
        let p = policy();
        assert!(p.validate_url("https://example.com/page?q=1").is_ok());
        assert!(p.validate_url("http://localhost:8080/health").is_ok());
        assert!(p.validate_url("https://evil.example.net/").is_err());
        assert!(p.validate_url("ftp://example.com/file").is_err());
        assert!(p.validate_url("not a url").is_err());
    }

    #[test]
    fn validate_args_checks_only_formatted_properties() {
        let schema = ParamSchema::new()
            .property("file", ParamSpec::path())
            .property("endpoint", ParamSpec::url())
            .property("note", ParamSpec::string());
        let p = policy();

        assert!(p
            .validate_args(&schema, &json!({"file": "a.txt", "note": "../fine-in-plain-strings"}))
            .is_ok());
        assert!(p
            .validate_args(&schema, &json!({"file": "../a.txt"}))
            .is_err());
        assert!(p
            .validate_args(&schema, &json!({"endpoint": "https://evil.example.net"}))
            .is_err());
    }
}
