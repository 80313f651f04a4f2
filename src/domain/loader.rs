//! Scenario Loader
//!
//! Reads a scenario (domain, initial facts, goals) from TOML or JSON.

use super::{Domain, Scenario};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

/// Loader for scenario and domain files
pub struct ScenarioLoader;

impl ScenarioLoader {
    /// Load and validate a scenario file
    pub async fn load(path: &Path) -> Result<Scenario> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read scenario file {}", path.display()))?;

        let scenario: Scenario = parse(path, &content)?;
        scenario
            .domain
            .validate()
            .with_context(|| format!("Invalid domain in {}", path.display()))?;

        info!(
            "Loaded scenario '{}': {} actions, {} methods, {} facts, {} goals",
            scenario.domain.name,
            scenario.domain.actions.len(),
            scenario.domain.methods.len() + scenario.domain.goal_methods.len(),
            scenario.facts.len(),
            scenario.goals.len()
        );
        Ok(scenario)
    }

    /// Load and validate a domain-only file
    pub async fn load_domain(path: &Path) -> Result<Domain> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read domain file {}", path.display()))?;

        let domain: Domain = parse(path, &content)?;
        domain.validate()?;
        Ok(domain)
    }

    /// Parse scenario text, TOML first then JSON
    pub fn parse_str(content: &str) -> Result<Scenario> {
        let scenario: Scenario = toml::from_str(content)
            .or_else(|_| serde_json::from_str(content))
            .context("Failed to parse scenario")?;
        scenario.domain.validate()?;
        Ok(scenario)
    }
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "toml" => toml::from_str(content).context("Failed to parse TOML"),
        "json" => serde_json::from_str(content).context("Failed to parse JSON"),
        _ => toml::from_str(content)
            .or_else(|_| serde_json::from_str(content))
            .context("Failed to parse scenario file"),
    }
}
