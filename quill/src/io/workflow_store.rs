//! Workflow definitions under `.quill/workflows/<id>.toml`.

use std::fs;

use anyhow::{Context, Result, anyhow};

use crate::core::types::Workflow;
use crate::io::layout::QuillPaths;

/// Load and validate a workflow. The id always comes from the file name.
pub fn load_workflow(paths: &QuillPaths, workflow_id: &str) -> Result<Workflow> {
    if workflow_id.is_empty()
        || workflow_id.contains(['/', '\\'])
        || workflow_id.starts_with('.')
    {
        return Err(anyhow!("invalid workflow id '{workflow_id}'"));
    }
    let path = paths.workflow_path(workflow_id);
    if !path.exists() {
        return Err(anyhow!(
            "workflow '{workflow_id}' not found at {}",
            path.display()
        ));
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut workflow: Workflow =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    workflow.id = workflow_id.to_string();
    validate_workflow(&workflow).with_context(|| format!("validate {}", path.display()))?;
    Ok(workflow)
}

pub fn validate_workflow(workflow: &Workflow) -> Result<()> {
    if workflow.steps.is_empty() {
        return Err(anyhow!("workflow must have at least one step"));
    }
    for (i, step) in workflow.steps.iter().enumerate() {
        if step.role.trim().is_empty() {
            return Err(anyhow!("steps[{i}].role must not be empty"));
        }
        if let Some(t) = step.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(anyhow!("steps[{i}].temperature must be within 0.0..=2.0"));
        }
        if step.document_name() == "request" {
            return Err(anyhow!(
                "steps[{i}] cannot produce a document named 'request' (reserved for the initial prompt)"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(paths: &QuillPaths, id: &str, body: &str) {
        fs::create_dir_all(&paths.workflows_dir).expect("mkdir");
        fs::write(paths.workflow_path(id), body).expect("write");
    }

    #[test]
    fn id_comes_from_file_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = QuillPaths::new(temp.path());
        write(
            &paths,
            "essay",
            "id = \"ignored\"\n[defaults]\nmodel = \"m\"\n[[steps]]\nrole = \"writer\"\nmodel = \"m2\"\n",
        );
        let wf = load_workflow(&paths, "essay").expect("load");
        assert_eq!(wf.id, "essay");
        assert_eq!(wf.defaults.model.as_deref(), Some("m"));
        assert_eq!(wf.steps[0].model.as_deref(), Some("m2"));
    }

    #[test]
    fn empty_workflows_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = QuillPaths::new(temp.path());
        write(&paths, "empty", "description = \"nothing\"\n");
        let err = load_workflow(&paths, "empty").unwrap_err();
        assert!(format!("{err:#}").contains("at least one step"));
    }

    #[test]
    fn missing_and_unsafe_ids_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = QuillPaths::new(temp.path());
        assert!(load_workflow(&paths, "nope").unwrap_err().to_string().contains("not found"));
        assert!(load_workflow(&paths, "../x").is_err());
    }
}
