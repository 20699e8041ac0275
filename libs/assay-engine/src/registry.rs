// Language registry: loaded once from languages.json, read-only afterwards

use crate::error::RegistryError;
use anyhow::{bail, Context, Result};
use assay_common::types::LanguageInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Placeholder in command templates replaced by the source file name
pub const SOURCE_PLACEHOLDER: &str = "{source}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStyle {
    /// `//` and `/* */`
    #[default]
    C,
    /// `#` to end of line
    Hash,
    /// `//` and `/* */`, with single quotes delimiting strings as in JavaScript
    Script,
}

impl CommentStyle {
    pub fn has_slash_comments(self) -> bool {
        matches!(self, Self::C | Self::Script)
    }

    /// Whether `'` opens a string rather than a char literal
    pub fn single_quote_strings(self) -> bool {
        matches!(self, Self::Hash | Self::Script)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub file_extension: String,
    pub source_file: String,
    #[serde(default)]
    pub compile: Option<String>,
    pub run: String,
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    #[serde(default)]
    pub comment_style: CommentStyle,
    #[serde(default)]
    pub starter_template: String,
}

impl LanguageConfig {
    pub fn compile_command(&self) -> Option<String> {
        self.compile
            .as_deref()
            .map(|c| c.replace(SOURCE_PLACEHOLDER, &self.source_file))
    }

    pub fn run_command(&self) -> String {
        self.run.replace(SOURCE_PLACEHOLDER, &self.source_file)
    }

    pub fn info(&self) -> LanguageInfo {
        LanguageInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            extension: self.file_extension.clone(),
            timeout_ms: self.timeout_ms,
            memory_limit_mb: self.memory_limit_mb,
            starter_template: self.starter_template.clone(),
        }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidLanguage {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("identifier is empty"));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be greater than zero"));
        }
        if self.memory_limit_mb == 0 {
            return Err(invalid("memory_limit_mb must be greater than zero"));
        }
        if self.cpu_limit.is_nan() || self.cpu_limit <= 0.0 {
            return Err(invalid("cpu_limit must be greater than zero"));
        }
        if self.run.trim().is_empty() {
            return Err(invalid("run command is empty"));
        }
        let ext = self.file_extension.trim_start_matches('.');
        if ext.is_empty() || !self.source_file.ends_with(&format!(".{ext}")) {
            return Err(invalid("source_file does not carry file_extension"));
        }
        if self.source_file.contains('/') || self.source_file.contains('\'') {
            return Err(invalid("source_file must be a plain file name"));
        }
        Ok(())
    }
}

/// On-disk shape of config/languages.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageConfig>,
}

impl LanguagesFile {
    pub fn builtin() -> Self {
        Self {
            languages: builtin_languages(),
        }
    }
}

/// Immutable map from language identifier to its execution recipe
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: BTreeMap<String, Arc<LanguageConfig>>,
}

impl LanguageRegistry {
    pub fn from_configs(configs: Vec<LanguageConfig>) -> Result<Self, RegistryError> {
        let mut languages = BTreeMap::new();
        for mut config in configs {
            config.name = config.name.trim().to_ascii_lowercase();
            config.validate()?;
            if languages.contains_key(&config.name) {
                return Err(RegistryError::DuplicateLanguage(config.name));
            }
            languages.insert(config.name.clone(), Arc::new(config));
        }
        if languages.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Self { languages })
    }

    /// Load language configurations from a languages.json file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Language config file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: LanguagesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Self::from_configs(file.languages)
            .with_context(|| format!("Invalid language config in {}", path.display()))
    }

    /// The registry compiled into the binary
    pub fn builtin() -> Self {
        let languages = builtin_languages()
            .into_iter()
            .map(|config| (config.name.clone(), Arc::new(config)))
            .collect();
        Self { languages }
    }

    /// Load `path` when present, otherwise fall back to the built-in set
    pub fn load_or_builtin(path: &Path) -> Result<Self> {
        if path.exists() {
            let registry = Self::load(path)?;
            info!(
                path = %path.display(),
                languages = ?registry.list_supported(),
                "Loaded language registry"
            );
            Ok(registry)
        } else {
            warn!(
                path = %path.display(),
                "Language config not found, using built-in languages"
            );
            Ok(Self::builtin())
        }
    }

    pub fn lookup(&self, identifier: &str) -> Result<Arc<LanguageConfig>, RegistryError> {
        let key = identifier.trim().to_ascii_lowercase();
        self.languages
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::UnsupportedLanguage(identifier.to_string()))
    }

    /// Identifiers in alphabetical order
    pub fn list_supported(&self) -> Vec<String> {
        self.languages.keys().cloned().collect()
    }

    pub fn describe(&self) -> Vec<LanguageInfo> {
        self.languages.values().map(|l| l.info()).collect()
    }

    pub fn configs(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.languages.values().map(|l| l.as_ref())
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

fn builtin_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "python".into(),
            version: "3.12".into(),
            image: "python:3.12-slim".into(),
            file_extension: "py".into(),
            source_file: "main.py".into(),
            compile: None,
            run: "python3 -u {source}".into(),
            timeout_ms: 10_000,
            memory_limit_mb: 256,
            cpu_limit: 1.0,
            comment_style: CommentStyle::Hash,
            starter_template: "def main():\n    pass\n\n\nif __name__ == \"__main__\":\n    main()\n"
                .into(),
        },
        LanguageConfig {
            name: "javascript".into(),
            version: "22".into(),
            image: "node:22-slim".into(),
            file_extension: "js".into(),
            source_file: "main.js".into(),
            compile: None,
            run: "node {source}".into(),
            timeout_ms: 10_000,
            memory_limit_mb: 256,
            cpu_limit: 1.0,
            comment_style: CommentStyle::Script,
            starter_template: "const input = require(\"fs\").readFileSync(0, \"utf8\");\n\nfunction main() {\n}\n\nmain();\n"
                .into(),
        },
        LanguageConfig {
            name: "java".into(),
            version: "21".into(),
            image: "eclipse-temurin:21-jdk".into(),
            file_extension: "java".into(),
            source_file: "Main.java".into(),
            compile: Some("javac {source}".into()),
            run: "java -Xss64m -cp . Main".into(),
            timeout_ms: 10_000,
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            comment_style: CommentStyle::C,
            starter_template: "import java.util.*;\n\npublic class Main {\n    public static void main(String[] args) {\n    }\n}\n"
                .into(),
        },
        LanguageConfig {
            name: "c".into(),
            version: "14".into(),
            image: "gcc:14".into(),
            file_extension: "c".into(),
            source_file: "main.c".into(),
            compile: Some("gcc -O2 -std=c17 -o main {source} -lm".into()),
            run: "./main".into(),
            timeout_ms: 10_000,
            memory_limit_mb: 256,
            cpu_limit: 1.0,
            comment_style: CommentStyle::C,
            starter_template: "#include <stdio.h>\n\nint main(void) {\n    return 0;\n}\n".into(),
        },
        LanguageConfig {
            name: "cpp".into(),
            version: "14".into(),
            image: "gcc:14".into(),
            file_extension: "cpp".into(),
            source_file: "main.cpp".into(),
            compile: Some("g++ -O2 -std=c++17 -o main {source}".into()),
            run: "./main".into(),
            timeout_ms: 10_000,
            memory_limit_mb: 256,
            cpu_limit: 1.0,
            comment_style: CommentStyle::C,
            starter_template: "#include <bits/stdc++.h>\nusing namespace std;\n\nint main() {\n    return 0;\n}\n"
                .into(),
        },
        LanguageConfig {
            name: "rust".into(),
            version: "1.82".into(),
            image: "rust:1.82-slim".into(),
            file_extension: "rs".into(),
            source_file: "main.rs".into(),
            compile: Some("rustc -O -o main {source}".into()),
            run: "./main".into(),
            timeout_ms: 10_000,
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            comment_style: CommentStyle::C,
            starter_template: "use std::io::{self, Read};\n\nfn main() {\n    let mut input = String::new();\n    io::stdin().read_to_string(&mut input).unwrap();\n}\n"
                .into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> LanguageConfig {
        LanguageConfig {
            name: name.to_string(),
            version: "1".into(),
            image: "busybox".into(),
            file_extension: "sh".into(),
            source_file: "main.sh".into(),
            compile: None,
            run: "sh {source}".into(),
            timeout_ms: 1000,
            memory_limit_mb: 64,
            cpu_limit: 0.5,
            comment_style: CommentStyle::Hash,
            starter_template: String::new(),
        }
    }

    #[test]
    fn test_builtin_registry_is_valid() {
        let registry = LanguageRegistry::from_configs(builtin_languages()).unwrap();
        assert_eq!(registry.len(), 6);
        assert_eq!(
            registry.list_supported(),
            vec!["c", "cpp", "java", "javascript", "python", "rust"]
        );
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = LanguageRegistry::builtin();
        let python = registry.lookup("Python").unwrap();
        assert_eq!(python.name, "python");
        assert_eq!(python.run_command(), "python3 -u main.py");
        assert!(python.compile_command().is_none());
    }

    #[test]
    fn test_lookup_unknown_language() {
        let registry = LanguageRegistry::builtin();
        let err = registry.lookup("cobol").unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedLanguage(ref l) if l == "cobol"));
    }

    #[test]
    fn test_javascript_uses_script_comment_style() {
        let registry = LanguageRegistry::builtin();
        let js = registry.lookup("javascript").unwrap();
        assert_eq!(js.comment_style, CommentStyle::Script);
        assert!(js.comment_style.has_slash_comments());
        assert!(js.comment_style.single_quote_strings());
        assert!(!CommentStyle::C.single_quote_strings());

        let parsed: CommentStyle = serde_json::from_str("\"script\"").unwrap();
        assert_eq!(parsed, CommentStyle::Script);
    }

    #[test]
    fn test_compile_template_substitution() {
        let registry = LanguageRegistry::builtin();
        let java = registry.lookup("java").unwrap();
        assert_eq!(java.compile_command().as_deref(), Some("javac Main.java"));
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = LanguageRegistry::from_configs(vec![sample("sh"), sample("SH")]).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateLanguage(_)));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = sample("sh");
        config.timeout_ms = 0;
        let err = LanguageRegistry::from_configs(vec![config]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidLanguage { .. }));
    }

    #[test]
    fn test_rejects_mismatched_extension() {
        let mut config = sample("sh");
        config.source_file = "main.py".into();
        assert!(LanguageRegistry::from_configs(vec![config]).is_err());
    }

    #[test]
    fn test_rejects_empty_registry() {
        assert!(matches!(
            LanguageRegistry::from_configs(Vec::new()),
            Err(RegistryError::Empty)
        ));
    }

    #[test]
    fn test_describe_carries_starter_template() {
        let registry = LanguageRegistry::builtin();
        let infos = registry.describe();
        let python = infos.iter().find(|i| i.name == "python").unwrap();
        assert_eq!(python.extension, "py");
        assert_eq!(python.timeout_ms, 10_000);
        assert!(python.starter_template.contains("def main"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("assay-registry-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("languages.json");
        let file = LanguagesFile {
            languages: vec![sample("sh")],
        };
        fs::write(&path, serde_json::to_string_pretty(&file).unwrap()).unwrap();

        let registry = LanguageRegistry::load(&path).unwrap();
        assert_eq!(registry.list_supported(), vec!["sh"]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(LanguageRegistry::load(Path::new("/nonexistent/languages.json")).is_err());
    }

    #[test]
    fn test_shipped_config_matches_builtin() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let shipped = LanguageRegistry::load(&path).unwrap();
        assert_eq!(shipped.list_supported(), LanguageRegistry::builtin().list_supported());
    }
}
