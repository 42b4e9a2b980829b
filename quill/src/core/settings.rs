//! Effective backend settings for a step.

use serde::{Deserialize, Serialize};

use crate::core::types::{Step, StepDefaults};

/// Fully resolved backend settings for one step invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSettings {
    pub model: String,
    pub temperature: f64,
    pub engine: String,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-pro".to_string(),
            temperature: 0.7,
            engine: "gemini".to_string(),
        }
    }
}

/// Resolve settings: step override, then workflow default, then global default.
pub fn resolve_settings(step: &Step, workflow: &StepDefaults, global: &StepSettings) -> StepSettings {
    StepSettings {
        model: step
            .model
            .clone()
            .or_else(|| workflow.model.clone())
            .unwrap_or_else(|| global.model.clone()),
        temperature: step
            .temperature
            .or(workflow.temperature)
            .unwrap_or(global.temperature),
        engine: step
            .engine
            .clone()
            .or_else(|| workflow.engine.clone())
            .unwrap_or_else(|| global.engine.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(model: Option<&str>, temperature: Option<f64>) -> Step {
        Step {
            role: "writer".to_string(),
            model: model.map(str::to_string),
            temperature,
            engine: None,
            handoff: None,
            document: None,
        }
    }

    #[test]
    fn step_override_wins() {
        let workflow = StepDefaults {
            model: Some("workflow-model".to_string()),
            temperature: Some(0.2),
            engine: Some("codex".to_string()),
        };
        let resolved = resolve_settings(
            &step(Some("step-model"), Some(0.9)),
            &workflow,
            &StepSettings::default(),
        );
        assert_eq!(resolved.model, "step-model");
        assert_eq!(resolved.temperature, 0.9);
        assert_eq!(resolved.engine, "codex");
    }

    #[test]
    fn falls_back_to_workflow_then_global() {
        let workflow = StepDefaults {
            model: None,
            temperature: Some(0.1),
            engine: None,
        };
        let global = StepSettings::default();
        let resolved = resolve_settings(&step(None, None), &workflow, &global);
        assert_eq!(resolved.model, global.model);
        assert_eq!(resolved.temperature, 0.1);
        assert_eq!(resolved.engine, global.engine);
    }
}
