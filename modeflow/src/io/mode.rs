//! Mode files on disk and the catalog ("pack") that groups them.
//!
//! Mode files are `.json` or `.toml`. Both are read into an untyped
//! [`serde_json::Value`] so the rest of the crate normalizes one shape.
//! Loader failures are reported as [`ValidationError`] values.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::normalize::normalize_mode;
use crate::core::runtime_policy::RuntimePolicy;
use crate::core::types::{ValidationError, ValidationErrorKind};
use crate::flow::FlowSpec;

pub const PACK_MANIFEST: &str = "pack.toml";
const MODE_EXTENSIONS: [&str; 2] = ["json", "toml"];

/// A loaded mode: metadata plus its normalized flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    pub name: String,
    pub description: Option<String>,
    pub runtime_policy: Option<RuntimePolicy>,
    pub flow: FlowSpec,
}

impl Mode {
    /// Build a mode from an untyped document. The flow is normalized; a
    /// malformed mode-level `runtimePolicy` is a PARSE error.
    pub fn from_document(document: &Value) -> Result<Self, Vec<ValidationError>> {
        let flow = normalize_mode(document)?;
        let name = document
            .get("name")
            .and_then(Value::as_str)
            .or(flow.name.as_deref())
            .unwrap_or("unnamed")
            .to_string();
        let description = document
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let runtime_policy = match document
            .get("runtimePolicy")
            .or_else(|| document.get("runtime_policy"))
        {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value(raw.clone()).map_err(|err| {
                vec![ValidationError::new(
                    ValidationErrorKind::Parse,
                    format!("mode runtimePolicy: {err}"),
                )]
            })?),
        };
        Ok(Self {
            name,
            description,
            runtime_policy,
            flow,
        })
    }
}

/// Read a mode file into an untyped document.
///
/// When the document carries no `name`, the file stem is used.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_mode_document(path: &Path) -> Result<Value, ValidationError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ValidationError::new(
            ValidationErrorKind::Parse,
            format!("read {}: {err}", path.display()),
        )
    })?;
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let mut document: Value = match extension {
        "toml" => toml::from_str(&contents).map_err(|err| {
            ValidationError::new(
                ValidationErrorKind::Parse,
                format!("parse {}: {err}", path.display()),
            )
        })?,
        _ => serde_json::from_str(&contents).map_err(|err| {
            ValidationError::new(
                ValidationErrorKind::Parse,
                format!("parse {}: {err}", path.display()),
            )
        })?,
    };

    if let (Some(object), Some(stem)) = (
        document.as_object_mut(),
        path.file_stem().and_then(|stem| stem.to_str()),
    ) {
        object
            .entry("name")
            .or_insert_with(|| Value::String(stem.to_string()));
    }
    debug!("mode document loaded");
    Ok(document)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PackManifest {
    name: Option<String>,
    runtime_policy: Option<RuntimePolicy>,
}

/// Catalog contents as reported by `modeflow modes`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogListing {
    pub pack: String,
    pub modes: Vec<ModeSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSummary {
    pub name: String,
    pub description: Option<String>,
    /// Load or normalization errors; empty when the mode is usable.
    pub errors: Vec<ValidationError>,
}

/// A directory of mode files with an optional `pack.toml`.
///
/// Constructed explicitly and handed to whoever needs it.
#[derive(Debug, Clone)]
pub struct ModeCatalog {
    dir: PathBuf,
    manifest: PackManifest,
}

impl ModeCatalog {
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ValidationError::new(
                ValidationErrorKind::Catalog,
                format!("catalog directory not found: {}", dir.display()),
            ));
        }
        let manifest_path = dir.join(PACK_MANIFEST);
        let manifest = if manifest_path.is_file() {
            let contents = fs::read_to_string(&manifest_path).map_err(|err| {
                ValidationError::new(
                    ValidationErrorKind::Catalog,
                    format!("read {}: {err}", manifest_path.display()),
                )
            })?;
            toml::from_str(&contents).map_err(|err| {
                ValidationError::new(
                    ValidationErrorKind::Catalog,
                    format!("parse {}: {err}", manifest_path.display()),
                )
            })?
        } else {
            PackManifest::default()
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    /// Pack name from `pack.toml`, else the directory name.
    pub fn name(&self) -> String {
        self.manifest.name.clone().unwrap_or_else(|| {
            self.dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }

    /// Pack-level runtime policy layer.
    pub fn runtime_policy(&self) -> Option<&RuntimePolicy> {
        self.manifest.runtime_policy.as_ref()
    }

    /// Names of every mode file in the catalog, sorted.
    pub fn mode_names(&self) -> Result<Vec<String>, ValidationError> {
        let entries = fs::read_dir(&self.dir).map_err(|err| {
            ValidationError::new(
                ValidationErrorKind::Catalog,
                format!("list {}: {err}", self.dir.display()),
            )
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && !path.ends_with(PACK_MANIFEST))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| MODE_EXTENSIONS.contains(&ext))
            })
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Summarize every mode in the catalog. A mode that fails to load is
    /// listed with its errors rather than failing the whole listing.
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub fn list(&self) -> Result<CatalogListing, ValidationError> {
        let modes = self
            .mode_names()?
            .into_iter()
            .map(|name| {
                let loaded = self
                    .load(&name)
                    .map_err(|err| vec![err])
                    .and_then(|document| Mode::from_document(&document));
                match loaded {
                    Ok(mode) => ModeSummary {
                        name,
                        description: mode.description,
                        errors: Vec::new(),
                    },
                    Err(errors) => ModeSummary {
                        name,
                        description: None,
                        errors,
                    },
                }
            })
            .collect();
        Ok(CatalogListing {
            pack: self.name(),
            modes,
        })
    }

    /// Load the untyped document for `name`. Unknown modes are CATALOG errors
    /// naming the modes that do exist.
    pub fn load(&self, name: &str) -> Result<Value, ValidationError> {
        let unknown = || {
            let available = match self.mode_names() {
                Ok(names) if !names.is_empty() => names.join(", "),
                _ => "none".to_string(),
            };
            ValidationError::new(
                ValidationErrorKind::Catalog,
                format!(
                    "unknown mode '{name}' in catalog {} (available: {available})",
                    self.dir.display()
                ),
            )
        };
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(unknown());
        }
        let path = MODE_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{name}.{ext}")))
            .find(|path| path.is_file())
            .ok_or_else(unknown)?;
        load_mode_document(&path)
    }
}

/// The workspace root must be an existing directory.
pub fn check_workspace_root(path: &Path) -> Result<PathBuf, ValidationError> {
    if path.is_dir() {
        Ok(path.to_path_buf())
    } else {
        Err(ValidationError::new(
            ValidationErrorKind::Repo,
            format!("workspace root is not a directory: {}", path.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOML_MODE: &str = r#"
description = "single step"

[runtimePolicy.model]
preferred = "mode-model"

[flow]
version = "1"

[[flow.nodes]]
id = "a"
role = "planner"
goal = "plan"
expectedSchema = "multiPlan"
prompt = { system = "sys", user = "usr" }
"#;

    #[test]
    fn loads_toml_mode_and_names_it_after_the_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("review.toml");
        fs::write(&path, TOML_MODE).expect("write");

        let document = load_mode_document(&path).expect("load");
        let mode = Mode::from_document(&document).expect("mode");
        assert_eq!(mode.name, "review");
        assert_eq!(mode.description.as_deref(), Some("single step"));
        assert_eq!(mode.flow.nodes.len(), 1);
        let model = mode.runtime_policy.and_then(|p| p.model).expect("model");
        assert_eq!(model.preferred, "mode-model");
    }

    #[test]
    fn unparseable_file_is_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("broken.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_mode_document(&path).expect_err("should fail");
        assert_eq!(err.kind, ValidationErrorKind::Parse);
    }

    #[test]
    fn document_without_flow_is_no_flow() {
        let errors = Mode::from_document(&json!({"name": "empty"})).expect_err("should fail");
        assert_eq!(errors[0].kind, ValidationErrorKind::NoFlow);
    }

    #[test]
    fn catalog_lists_loads_and_rejects_unknown_modes() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("review.toml"), TOML_MODE).expect("write");
        fs::write(
            temp.path().join(PACK_MANIFEST),
            "name = \"starter\"\n\n[runtime_policy.budget]\nmax_tokens = 1000\n",
        )
        .expect("write");
        fs::write(temp.path().join("README.md"), "ignored").expect("write");

        let catalog = ModeCatalog::open(temp.path()).expect("open");
        assert_eq!(catalog.name(), "starter");
        assert_eq!(catalog.mode_names().expect("names"), vec!["review"]);
        let budget = catalog
            .runtime_policy()
            .and_then(|p| p.budget.clone())
            .expect("budget");
        assert_eq!(budget.max_tokens, Some(1000));

        assert!(catalog.load("review").is_ok());
        let unknown = catalog.load("missing").expect_err("unknown");
        assert_eq!(unknown.kind, ValidationErrorKind::Catalog);
        assert!(unknown.message.contains("available: review"), "{}", unknown.message);
        assert_eq!(
            catalog.load("../review").expect_err("escape").kind,
            ValidationErrorKind::Catalog
        );
    }

    #[test]
    fn missing_catalog_and_workspace_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("nope");
        assert_eq!(
            ModeCatalog::open(&missing).expect_err("catalog").kind,
            ValidationErrorKind::Catalog
        );
        assert_eq!(
            check_workspace_root(&missing).expect_err("root").kind,
            ValidationErrorKind::Repo
        );
        assert!(check_workspace_root(temp.path()).is_ok());
    }

    #[test]
    fn listing_reports_descriptions_and_broken_modes() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("review.toml"), TOML_MODE).expect("write");
        fs::write(temp.path().join("broken.json"), "{ \"name\": \"broken\" }").expect("write");

        let listing = ModeCatalog::open(temp.path()).expect("open").list().expect("list");
        let dir_name = temp.path().file_name().map(|n| n.to_string_lossy().into_owned());
        assert_eq!(Some(listing.pack), dir_name);
        assert_eq!(listing.modes.len(), 2);

        let broken = &listing.modes[0];
        assert_eq!(broken.name, "broken");
        assert_eq!(broken.errors[0].kind, ValidationErrorKind::NoFlow);

        let review = &listing.modes[1];
        assert_eq!(review.name, "review");
        assert_eq!(review.description.as_deref(), Some("single step"));
        assert!(review.errors.is_empty());
    }
}
