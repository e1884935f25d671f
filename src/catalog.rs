//! Journey Template Catalog
//!
//! Read-only registry of journey templates. Templates are registered at
//! startup (usually from YAML documents) and treated as immutable input by
//! the engine — the catalog validates ordering once, at registration, so the
//! engine can trust the stage sequence afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::JourneyError;

/// Upper bound on `sla_days` (100 years). Keeps due-date arithmetic far
/// inside chrono's representable range.
pub const MAX_SLA_DAYS: u32 = 36_500;

/// One ordered step of a journey template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTemplate {
    /// Position within the template (unique, dense from 0)
    pub order_index: u32,
    /// Display title (e.g., "Intake interview")
    pub title: String,
    /// Stage type code — drives UI affordances, not engine logic
    #[serde(default = "default_stage_type")]
    pub stage_type: String,
    /// Target duration in days once the stage starts; `None` = no SLA
    #[serde(default)]
    pub sla_days: Option<u32>,
}

fn default_stage_type() -> String {
    "task".to_string()
}

/// A reusable journey definition — immutable after registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyTemplate {
    /// Template ID (e.g., "litigation_standard")
    pub template_id: String,
    /// Display name
    pub name: String,
    /// Template version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Ordered stage templates
    pub stages: Vec<StageTemplate>,
}

fn default_version() -> u32 {
    1
}

impl JourneyTemplate {
    /// Validate structural rules: non-empty id, bounded SLAs, and dense,
    /// unique order indices starting at 0. An empty stage list is legal
    /// here — it is rejected at journey creation with `TemplateHasNoStages`
    /// so the catalog can still hold drafts.
    pub fn validate(&self) -> Result<(), JourneyError> {
        if self.template_id.trim().is_empty() {
            return Err(JourneyError::Catalog(
                "template_id must not be empty".to_string(),
            ));
        }

        for stage in &self.stages {
            if let Some(days) = stage.sla_days {
                if days > MAX_SLA_DAYS {
                    return Err(JourneyError::Catalog(format!(
                        "template '{}' stage '{}' has sla_days {} (max {})",
                        self.template_id, stage.title, days, MAX_SLA_DAYS
                    )));
                }
            }
        }

        let mut seen: Vec<u32> = self.stages.iter().map(|s| s.order_index).collect();
        seen.sort_unstable();
        for (expected, actual) in seen.iter().enumerate() {
            if *actual != expected as u32 {
                return Err(JourneyError::Catalog(format!(
                    "template '{}' has non-dense stage order indices (expected {}, found {})",
                    self.template_id, expected, actual
                )));
            }
        }

        Ok(())
    }

    /// Stages sorted by order index
    pub fn ordered_stages(&self) -> Vec<&StageTemplate> {
        let mut stages: Vec<&StageTemplate> = self.stages.iter().collect();
        stages.sort_by_key(|s| s.order_index);
        stages
    }
}

/// In-memory template registry supplied to the engine at construction
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    templates: HashMap<String, JourneyTemplate>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, validating its structure
    pub fn insert(&mut self, template: JourneyTemplate) -> Result<(), JourneyError> {
        template.validate()?;
        if self.templates.contains_key(&template.template_id) {
            return Err(JourneyError::Catalog(format!(
                "duplicate template_id '{}'",
                template.template_id
            )));
        }
        self.templates.insert(template.template_id.clone(), template);
        Ok(())
    }

    /// Look up a template by ID
    pub fn get(&self, template_id: &str) -> Option<&JourneyTemplate> {
        self.templates.get(template_id)
    }

    /// Ordered stage templates for a journey template
    pub fn stage_templates(&self, template_id: &str) -> Result<Vec<&StageTemplate>, JourneyError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| JourneyError::TemplateNotFound(template_id.to_string()))?;
        Ok(template.ordered_stages())
    }

    /// Registered template IDs
    pub fn template_ids(&self) -> Vec<&str> {
        self.templates.keys().map(|k| k.as_str()).collect()
    }

    /// Load a catalog from a YAML document containing a list of templates
    pub fn from_yaml_str(yaml: &str) -> Result<Self, JourneyError> {
        let templates: Vec<JourneyTemplate> = serde_yaml::from_str(yaml)
            .map_err(|e| JourneyError::Catalog(format!("invalid template YAML: {}", e)))?;

        let mut catalog = Self::new();
        for template in templates {
            catalog.insert(template)?;
        }
        Ok(catalog)
    }

    /// Load a catalog from a YAML file on disk
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, JourneyError> {
        let yaml = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            JourneyError::Catalog(format!(
                "cannot read template file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml_str(&yaml)
    }
}
