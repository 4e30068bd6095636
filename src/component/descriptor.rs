//! Component descriptor loading.
//!
//! A descriptor is the JSON file that names a component, its implementation
//! language and the properties it accepts. Only the fields the runner needs are
//! parsed; everything else in the file is ignored.

use crate::error::{Result, RunnerError};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the installation root searched for descriptors.
pub const MPF_HOME_ENV: &str = "MPF_HOME";

/// Installation root used when [`MPF_HOME_ENV`] is unset.
pub const DEFAULT_MPF_HOME: &str = "/opt/mpf";

/// The parts of a component descriptor the runner uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub component_name: String,
    pub source_language: String,
    #[serde(default)]
    pub batch_library: Option<String>,
    /// Some descriptors carry the track type at the top level.
    #[serde(default)]
    track_type: Option<String>,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub environment_variables: Vec<EnvVarDef>,
    /// File the descriptor was read from.
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Algorithm {
    pub track_type: Option<String>,
    pub provides_collection: ProvidesCollection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidesCollection {
    pub properties: Vec<PropertyDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDef {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<String>,
}

/// An `environmentVariables` entry. With `sep`, the value is appended to an
/// existing non-empty value instead of replacing it.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvVarDef {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub sep: Option<String>,
}

impl Descriptor {
    /// Read and parse a descriptor file.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!("Loading descriptor from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|e| {
            RunnerError::Descriptor(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut descriptor: Descriptor = serde_json::from_str(&contents).map_err(|e| {
            RunnerError::Descriptor(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        descriptor.path = path.to_path_buf();
        Ok(descriptor)
    }

    /// Load the explicit descriptor if given, otherwise the single installed one.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let mpf_home = std::env::var_os(MPF_HOME_ENV)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MPF_HOME));
                Self::load(&find_installed(&mpf_home)?)
            }
        }
    }

    /// The track type, from the top level or from `algorithm.trackType`.
    pub fn track_type(&self) -> Result<&str> {
        self.track_type
            .as_deref()
            .or(self.algorithm.track_type.as_deref())
            .ok_or_else(|| {
                RunnerError::Descriptor(format!(
                    "{} does not declare a trackType",
                    self.component_name
                ))
            })
    }

    /// The `batchLibrary` entry with environment variables expanded.
    pub fn batch_library(&self) -> Result<String> {
        let raw = self.batch_library.as_deref().ok_or_else(|| {
            RunnerError::Descriptor(format!(
                "{} does not declare a batchLibrary",
                self.component_name
            ))
        })?;
        Ok(expand_env_vars(raw, &self.environment()))
    }

    /// The process environment with the descriptor's `environmentVariables` applied.
    ///
    /// Entries apply in order, so later values may refer to earlier ones.
    pub fn environment(&self) -> HashMap<String, String> {
        self.apply_environment(std::env::vars().collect())
    }

    /// The variables this descriptor sets, with their final values.
    pub fn environment_overrides(&self) -> Vec<(String, String)> {
        let env = self.environment();
        self.environment_variables
            .iter()
            .filter_map(|var| env.get_key_value(&var.name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn apply_environment(&self, mut env: HashMap<String, String>) -> HashMap<String, String> {
        for var in &self.environment_variables {
            let value = expand_env_vars(&var.value, &env);
            let value = match (var.sep.as_deref(), env.get(&var.name)) {
                (Some(sep), Some(existing)) if !existing.is_empty() => {
                    format!("{}{}{}", existing, sep, value)
                }
                _ => value,
            };
            env.insert(var.name.clone(), value);
        }
        env
    }

    /// Directory containing the descriptor file.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// `(name, default)` for every declared property with a default value.
    pub fn property_defaults(&self) -> impl Iterator<Item = (&str, &str)> {
        self.algorithm
            .provides_collection
            .properties
            .iter()
            .filter_map(|p| p.default_value.as_deref().map(|v| (p.name.as_str(), v)))
    }

    #[cfg(test)]
    pub(crate) fn for_test(name: &str, language: &str, library: &str) -> Self {
        Self {
            component_name: name.to_string(),
            source_language: language.to_string(),
            batch_library: Some(library.to_string()),
            track_type: Some("TEXT".to_string()),
            algorithm: Algorithm::default(),
            environment_variables: Vec::new(),
            path: PathBuf::from("/nonexistent/descriptor.json"),
        }
    }
}

/// Find the only `plugins/*/descriptor/descriptor.json` under `mpf_home`.
///
/// Zero or several matches are both errors, since the runner cannot pick one.
pub fn find_installed(mpf_home: &Path) -> Result<PathBuf> {
    let pattern = mpf_home.join("plugins/*/descriptor/descriptor.json");
    let plugins_dir = mpf_home.join("plugins");

    let mut matches = Vec::new();
    if let Ok(entries) = fs::read_dir(&plugins_dir) {
        for entry in entries.flatten() {
            let candidate = entry.path().join("descriptor").join("descriptor.json");
            if candidate.is_file() {
                matches.push(candidate);
            }
        }
    }
    matches.sort();

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(RunnerError::Descriptor(format!(
            "Expecting to find a descriptor file at \"{}\", but it was not there.",
            pattern.display()
        ))),
        _ => Err(RunnerError::Descriptor(format!(
            "Expected to find one descriptor matching \"{}\", but the following descriptors were found: {}",
            pattern.display(),
            matches
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Substitute `$NAME` and `${NAME}` with values from `env`; unknown names expand to "".
///
/// `$$` produces a literal `$`.
pub fn expand_env_vars(raw: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                out.push_str(env.get(&name).map(String::as_str).unwrap_or(""));
            }
            Some(&c) if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(env.get(&name).map(String::as_str).unwrap_or(""));
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DESCRIPTOR: &str = r#"{
        "componentName": "EchoText",
        "componentVersion": "1.0",
        "sourceLanguage": "builtin",
        "batchLibrary": "echo",
        "environmentVariables": [],
        "algorithm": {
            "name": "ECHO",
            "trackType": "TEXT",
            "providesCollection": {
                "properties": [
                    {"name": "PREFIX", "type": "STRING", "defaultValue": ""},
                    {"name": "DELAY_MS", "type": "INT", "defaultValue": "10"},
                    {"name": "NO_DEFAULT", "type": "STRING"}
                ]
            }
        }
    }"#;

    fn write_plugin(home: &Path, name: &str) -> PathBuf {
        let dir = home.join("plugins").join(name).join("descriptor");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("descriptor.json");
        fs::write(&path, DESCRIPTOR).unwrap();
        path
    }

    #[test]
    fn test_load_descriptor() {
        let dir = tempdir().unwrap();
        let path = write_plugin(dir.path(), "Echo");
        let descriptor = Descriptor::load(&path).unwrap();

        assert_eq!(descriptor.component_name, "EchoText");
        assert_eq!(descriptor.source_language, "builtin");
        assert_eq!(descriptor.track_type().unwrap(), "TEXT");
        assert_eq!(descriptor.batch_library().unwrap(), "echo");
        assert_eq!(descriptor.directory(), path.parent().unwrap());

        let defaults: Vec<_> = descriptor.property_defaults().collect();
        assert_eq!(defaults, vec![("PREFIX", ""), ("DELAY_MS", "10")]);
    }

    #[test]
    fn test_top_level_track_type() {
        let json = r#"{"componentName": "C", "sourceLanguage": "c++", "trackType": "FACE"}"#;
        let descriptor: Descriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.track_type().unwrap(), "FACE");
        assert!(descriptor.batch_library().is_err());
    }

    #[test]
    fn test_missing_track_type() {
        let json = r#"{"componentName": "C", "sourceLanguage": "builtin"}"#;
        let descriptor: Descriptor = serde_json::from_str(json).unwrap();
        let err = descriptor.track_type().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_malformed_descriptor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("descriptor.json");
        fs::write(&path, "{ not json").unwrap();
        let err = Descriptor::load(&path).unwrap_err();
        assert!(matches!(err, RunnerError::Descriptor(_)));
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_find_installed() {
        let dir = tempdir().unwrap();
        assert!(find_installed(dir.path()).is_err());

        let path = write_plugin(dir.path(), "Echo");
        assert_eq!(find_installed(dir.path()).unwrap(), path);

        write_plugin(dir.path(), "Other");
        let err = find_installed(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Expected to find one descriptor"));
    }

    #[test]
    fn test_environment_variables() {
        let json = r#"{
            "componentName": "C",
            "sourceLanguage": "subprocess",
            "batchLibrary": "${PLUGIN_DIR}/run.sh",
            "environmentVariables": [
                {"name": "PLUGIN_DIR", "value": "$MPF_HOME/plugins/C"},
                {"name": "LD_LIBRARY_PATH", "value": "${PLUGIN_DIR}/lib", "sep": ":"},
                {"name": "EMPTY_PATH", "value": "/first", "sep": ":"},
                {"name": "MODE", "value": "fast"}
            ]
        }"#;
        let descriptor: Descriptor = serde_json::from_str(json).unwrap();
        let base = HashMap::from([
            ("MPF_HOME".to_string(), "/opt/mpf".to_string()),
            ("LD_LIBRARY_PATH".to_string(), "/usr/lib".to_string()),
            ("EMPTY_PATH".to_string(), String::new()),
            ("MODE".to_string(), "slow".to_string()),
        ]);
        let env = descriptor.apply_environment(base);

        assert_eq!(env["PLUGIN_DIR"], "/opt/mpf/plugins/C");
        assert_eq!(env["LD_LIBRARY_PATH"], "/usr/lib:/opt/mpf/plugins/C/lib");
        assert_eq!(env["EMPTY_PATH"], "/first");
        // Without `sep` an existing value is replaced.
        assert_eq!(env["MODE"], "fast");
        assert_eq!(
            expand_env_vars(descriptor.batch_library.as_deref().unwrap(), &env),
            "/opt/mpf/plugins/C/run.sh"
        );
    }

    #[test]
    fn test_environment_overrides_lists_only_declared_vars() {
        let json = r#"{
            "componentName": "C",
            "sourceLanguage": "builtin",
            "environmentVariables": [{"name": "COMPRUNNER_TEST_DESCRIPTOR_VAR", "value": "x"}]
        }"#;
        let descriptor: Descriptor = serde_json::from_str(json).unwrap();
        assert_eq!(
            descriptor.environment_overrides(),
            vec![("COMPRUNNER_TEST_DESCRIPTOR_VAR".to_string(), "x".to_string())]
        );
    }

    #[test]
    fn test_expand_env_vars() {
        let env = HashMap::from([
            ("MPF_HOME".to_string(), "/opt/mpf".to_string()),
            ("NAME".to_string(), "echo".to_string()),
        ]);
        assert_eq!(
            expand_env_vars("$MPF_HOME/plugins/${NAME}/bin", &env),
            "/opt/mpf/plugins/echo/bin"
        );
        assert_eq!(expand_env_vars("$MISSING/x", &env), "/x");
        assert_eq!(expand_env_vars("cost: $$5", &env), "cost: $5");
        assert_eq!(expand_env_vars("trailing $", &env), "trailing $");
        assert_eq!(expand_env_vars("no vars", &env), "no vars");
    }
}
