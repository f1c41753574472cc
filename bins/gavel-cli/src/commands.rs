// CLI commands for running and judging code locally
use anyhow::{bail, Context, Result};
use gavel_common::config::EngineConfig;
use gavel_common::types::{Classification, ExecutionLimits, ProblemLimits, TestCase, Verdict};
use gavel_engine::{DockerSandbox, InputPolicy, JudgeEngine, JudgeOptions, LanguageRegistry, Sandbox};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Engine configuration from the environment, with an optional table override.
fn load_config(languages_file: Option<&Path>) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = languages_file {
        config.languages_file = Some(path.to_path_buf());
    }
    Ok(config)
}

fn load_registry(config: &EngineConfig) -> Result<LanguageRegistry> {
    match &config.languages_file {
        Some(path) => LanguageRegistry::load(path),
        None => Ok(LanguageRegistry::builtin()),
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Parse a JSON array of test cases.
fn parse_cases(content: &str) -> Result<Vec<TestCase>> {
    let cases: Vec<TestCase> =
        serde_json::from_str(content).context("Failed to parse test cases (expected a JSON array)")?;
    if cases.is_empty() {
        bail!("Test case file contains no cases");
    }
    Ok(cases)
}

fn classification_icon(classification: Classification) -> &'static str {
    match classification {
        Classification::Success => "✅",
        Classification::SystemError => "💥",
        _ => "❌",
    }
}

fn verdict_icon(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Accepted => "✅",
        Verdict::SystemError => "💥",
        _ => "❌",
    }
}

/// Run a source file once
pub async fn run_file(
    languages_file: Option<&Path>,
    language: &str,
    file: &Path,
    input: Option<&Path>,
    time_limit_ms: Option<u64>,
) -> Result<()> {
    let config = load_config(languages_file)?;
    let registry = Arc::new(load_registry(&config)?);

    let code = read_source(file)?;
    let stdin = match input {
        Some(path) => read_source(path)?,
        None => String::new(),
    };

    let limits = ExecutionLimits {
        time_limit_ms,
        memory_limit_mb: None,
    };
    let request = InputPolicy::from_config(&config)
        .validate(&registry, &code, language, &stdin, &limits)
        .map_err(|rejection| anyhow::anyhow!("Rejected: {}", rejection))?;

    println!("🚀 Running {} ({})", file.display(), request.language);

    let sandbox = DockerSandbox::connect(&config, registry)?;
    let outcome = sandbox.run(&request, &limits).await;

    println!(
        "{} {} (exit code: {}, {} ms, memory: {})",
        classification_icon(outcome.classification),
        outcome.classification.as_str(),
        outcome
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string()),
        outcome.wall_time_ms,
        outcome
            .memory_used_kb
            .map(|kb| format!("{} KB", kb))
            .unwrap_or_else(|| "n/a".to_string()),
    );

    if !outcome.stdout.is_empty() {
        println!("\n📤 stdout:\n{}", outcome.stdout);
    }
    if !outcome.stderr.is_empty() {
        println!("\n📥 stderr:\n{}", outcome.stderr);
    }
    if outcome.output_truncated {
        println!("\n⚠️  Output was truncated");
    }

    Ok(())
}

/// Judge a source file against a test case file
pub async fn judge_file(
    languages_file: Option<&Path>,
    language: &str,
    file: &Path,
    cases_path: &Path,
    time_limit_ms: u64,
    memory_limit_mb: u64,
    run_all: bool,
) -> Result<()> {
    let config = load_config(languages_file)?;
    let registry = Arc::new(load_registry(&config)?);

    let code = read_source(file)?;
    let cases = parse_cases(&read_source(cases_path)?)?;

    let problem_limits = ProblemLimits {
        time_limit_ms,
        memory_limit_mb,
    };
    let request = InputPolicy::from_config(&config)
        .validate_submission(&registry, &code, language, &cases, &problem_limits)
        .map_err(|rejection| anyhow::anyhow!("Rejected: {}", rejection))?;

    println!(
        "⚖️  Judging {} ({}) against {} case(s)",
        file.display(),
        request.language,
        cases.len()
    );

    let sandbox = Arc::new(DockerSandbox::connect(&config, registry)?);
    let judge = JudgeEngine::new(sandbox);
    let options = JudgeOptions {
        limits: problem_limits,
        run_all,
    };

    let result = judge
        .judge(&request.code, request.language, &cases, &options)
        .await;

    println!();
    println!("{:<6} {:<24} {:>10} {:>12}", "CASE", "VERDICT", "TIME", "MEMORY");
    println!("{}", "─".repeat(56));
    for case in &result.case_results {
        println!(
            "{:<6} {} {:<21} {:>7} ms {:>12}",
            case.index,
            verdict_icon(case.verdict),
            case.verdict.label(),
            case.outcome.wall_time_ms,
            case.outcome
                .memory_used_kb
                .map(|kb| format!("{} KB", kb))
                .unwrap_or_else(|| "n/a".to_string()),
        );
    }

    if let Some(failed) = result
        .case_results
        .iter()
        .find(|c| c.verdict != Verdict::Accepted)
    {
        if !failed.outcome.stderr.is_empty() {
            println!("\n📥 stderr of case {}:\n{}", failed.index, failed.outcome.stderr);
        }
    }

    println!(
        "\n{} {} - {}/{} passed, score {}",
        verdict_icon(result.final_verdict),
        result.final_verdict,
        result.passed_count,
        result.total_count,
        result.score
    );

    Ok(())
}

/// List configured languages
pub fn list_languages(languages_file: Option<&Path>) -> Result<()> {
    let config = load_config(languages_file)?;
    let registry = load_registry(&config)?;

    println!("📋 Configured Languages:\n");
    println!(
        "{:<12} {:<8} {:<32} {:<9} {:<10}",
        "LANGUAGE", "VERSION", "IMAGE", "COMPILED", "LIMITS"
    );
    println!("{}", "─".repeat(80));

    let profiles = registry.profiles();
    for profile in &profiles {
        println!(
            "{:<12} {:<8} {:<32} {:<9} {:.1}/{} MB",
            profile.language.as_str(),
            profile.version,
            profile.image,
            if profile.requires_compilation() { "yes" } else { "no" },
            profile.cpu_limit,
            profile.memory_limit_mb
        );
    }

    println!("\n✅ Total: {} language(s)", profiles.len());
    Ok(())
}

/// Write the built-in language table as JSON
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let json = LanguageRegistry::builtin().to_json()?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✅ Wrote language table to {}", path.display());
    println!("\n📋 Next steps:");
    println!("  1. Edit images or limits as needed");
    println!("  2. Export GAVEL_LANGUAGES_FILE={}", path.display());
    Ok(())
}

/// Pull every image the language table references
pub async fn pull_images(languages_file: Option<&Path>) -> Result<()> {
    let config = load_config(languages_file)?;
    let registry = Arc::new(load_registry(&config)?);

    let images: BTreeSet<String> = registry
        .profiles()
        .into_iter()
        .map(|p| p.image.clone())
        .collect();

    let sandbox = DockerSandbox::connect(&config, registry)?;
    sandbox.ping().await?;

    println!("🐳 Ensuring {} image(s)...", images.len());
    for image in &images {
        sandbox
            .ensure_image(image)
            .await
            .with_context(|| format!("Failed to pull {}", image))?;
        println!("  ✅ {}", image);
    }

    println!("\n✅ All images available");
    Ok(())
}
