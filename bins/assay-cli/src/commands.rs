// CLI commands for running submissions and managing languages
use anyhow::{bail, Context, Result};
use assay_common::config::{EngineSettings, SandboxBackendKind};
use assay_common::types::{ExecutionRequest, TestCategory};
use assay_engine::plagiarism;
use assay_engine::registry::{CommentStyle, LanguageConfig, LanguagesFile};
use assay_engine::sandbox::SandboxFactory;
use assay_engine::{AdmissionGate, LanguageRegistry, Orchestrator};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Arguments of `add-lang`
#[derive(Debug, Clone)]
pub struct NewLanguage {
    pub name: String,
    pub ext: String,
    pub version: String,
    pub image: String,
    pub run: String,
    pub compile: Option<String>,
    pub source_file: Option<String>,
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub comment_style: CommentStyle,
}

/// Load languages configuration, starting from the built-in set when absent
fn load_languages_file(config_path: &Path) -> Result<LanguagesFile> {
    if !config_path.exists() {
        return Ok(LanguagesFile::builtin());
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", config_path.display()))
}

/// Save languages configuration
fn save_languages_file(config_path: &Path, file: &LanguagesFile) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json_content =
        serde_json::to_string_pretty(file).context("Failed to serialize languages.json")?;
    fs::write(config_path, json_content + "\n")
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    Ok(())
}

/// Execute one request file locally and print the response
pub async fn run_request(
    config_path: &Path,
    request_path: &Path,
    backend: SandboxBackendKind,
) -> Result<()> {
    if backend == SandboxBackendKind::Process {
        eprintln!("⚠️  The process backend runs submissions directly on this host without isolation");
    }

    let content = fs::read_to_string(request_path)
        .with_context(|| format!("Failed to read {}", request_path.display()))?;
    let request: ExecutionRequest = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", request_path.display()))?;

    let settings = EngineSettings {
        sandbox_backend: backend,
        ..EngineSettings::from_env()
    };
    let registry = LanguageRegistry::load_or_builtin(config_path)?;
    let sandbox = SandboxFactory::from_settings(&settings)?;
    let gate = AdmissionGate::new(settings.max_concurrent_runs);
    let orchestrator = Orchestrator::new(Arc::new(registry), sandbox, gate, settings);

    eprintln!(
        "🚀 Running {} test case(s) in {} with the {} backend",
        request.total_test_cases(),
        request.language,
        backend
    );
    let response = orchestrator.respond(request).await;

    for category in TestCategory::ALL {
        for result in response.results(category) {
            let mark = if result.passed { "✓" } else { "✗" };
            eprintln!(
                "  {} {} #{} → {} ({}ms)",
                mark, category, result.index, result.status, result.runtime_ms
            );
        }
    }
    let summary = &response.execution_summary;
    eprintln!(
        "📊 Score: {}/{} passed, {:.2}%",
        summary.passed_test_cases, summary.total_test_cases, summary.score_percent
    );
    if response.plagiarism_report.flagged {
        eprintln!(
            "⚠️  Plagiarism flagged: max similarity {:.4}",
            response.plagiarism_report.max_similarity
        );
    }
    if let Some(error) = &response.error {
        eprintln!("❌ {}", error);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&response).context("Failed to serialize response")?
    );
    Ok(())
}

/// List all configured languages
pub fn list_languages(config_path: &Path) -> Result<()> {
    let registry = LanguageRegistry::load_or_builtin(config_path)?;

    println!("📋 Configured Languages:\n");
    println!(
        "{:<12} {:<10} {:<28} {:<12} {:<10}",
        "Name", "Version", "Image", "Timeout", "CPU/Mem"
    );
    println!("{}", "─".repeat(80));

    for lang in registry.configs() {
        println!(
            "{:<12} {:<10} {:<28} {:<12} {:.1}/{} MB",
            lang.name,
            lang.version,
            lang.image,
            format!("{}ms", lang.timeout_ms),
            lang.cpu_limit,
            lang.memory_limit_mb
        );
    }

    println!("\n✅ Total: {} language(s)", registry.len());
    Ok(())
}

/// Add a new language to languages.json
pub fn add_language(config_path: &Path, spec: NewLanguage) -> Result<()> {
    println!("🚀 Adding language: {}", spec.name);

    let mut file = load_languages_file(config_path)?;
    let ext = spec.ext.trim_start_matches('.').to_string();
    if spec.name.trim().is_empty() || ext.is_empty() {
        bail!("Language name and extension cannot be empty");
    }

    let source_file = spec
        .source_file
        .unwrap_or_else(|| format!("main.{}", ext));
    file.languages.push(LanguageConfig {
        name: spec.name.trim().to_ascii_lowercase(),
        version: spec.version,
        image: spec.image,
        file_extension: ext,
        source_file,
        compile: spec.compile,
        run: spec.run,
        timeout_ms: spec.timeout_ms,
        memory_limit_mb: spec.memory_limit_mb,
        cpu_limit: spec.cpu_limit,
        comment_style: spec.comment_style,
        starter_template: String::new(),
    });

    // Same validation the API applies at startup
    LanguageRegistry::from_configs(file.languages.clone())
        .context("Language configuration rejected")?;

    println!("📝 Updating {}...", config_path.display());
    save_languages_file(config_path, &file)?;

    println!("✅ Language '{}' added successfully!", spec.name);
    Ok(())
}

/// Write the default languages.json under `path`
pub fn init_project(path: &Path, force: bool) -> Result<()> {
    println!("🚀 Initializing Assay project at: {}", path.display());

    let config_path = path.join("config").join("languages.json");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    save_languages_file(&config_path, &LanguagesFile::builtin())?;
    println!("📝 Created {}", config_path.display());
    println!("✅ Project initialized!");
    println!("\n📋 Next steps:");
    println!("  1. Start the API: LANGUAGES_PATH={} assay-api", config_path.display());
    println!("  2. Add languages: assay-cli add-lang --name <name> --ext <ext> ...");
    Ok(())
}

/// Print the similarity between two sources
pub fn compare(config_path: &Path, language: &str, first: &Path, second: &Path) -> Result<()> {
    let registry = LanguageRegistry::load_or_builtin(config_path)?;
    let language = registry.lookup(language)?;
    let settings = EngineSettings::from_env();

    let a = fs::read_to_string(first)
        .with_context(|| format!("Failed to read {}", first.display()))?;
    let b = fs::read_to_string(second)
        .with_context(|| format!("Failed to read {}", second.display()))?;

    let score = plagiarism::similarity(&a, &b, language.comment_style, settings.plagiarism_kgram);
    let verdict = if score >= settings.plagiarism_threshold {
        "⚠️  flagged"
    } else {
        "✅ below threshold"
    };
    println!(
        "similarity {:.4} ({} {:.2})",
        score, verdict, settings.plagiarism_threshold
    );
    Ok(())
}
