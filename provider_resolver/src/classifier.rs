use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::UNKNOWN_SPECIALTY;
use crate::error::LlmError;
use crate::llm::{StructuredLlm, StructuredPrompt, strict_schema};
use crate::vocabulary::SpecialtyVocabulary;

#[derive(Debug, Deserialize, JsonSchema)]
struct TaskSpecialty {
    specialty: Option<String>,
}

/// Maps a follow-up task to one vocabulary code, or `"unknown"`.
#[derive(Clone)]
pub struct SpecialtyClassifier {
    llm: Arc<dyn StructuredLlm>,
}

impl SpecialtyClassifier {
    pub fn new(llm: Arc<dyn StructuredLlm>) -> Self {
        Self { llm }
    }

    pub async fn classify(
        &self,
        task: &str,
        vocabulary: &SpecialtyVocabulary,
    ) -> Result<String, LlmError> {
        let task = task.trim();
        if vocabulary.is_empty() || task.is_empty() {
            debug!(
                vocabulary = vocabulary.len(),
                "Nothing to classify against, returning unknown"
            );
            return Ok(UNKNOWN_SPECIALTY.to_string());
        }

        let prompt = classification_prompt(task, vocabulary);
        let raw = self.llm.complete_json(&prompt).await?;
        let specialty = interpret_answer(&raw, vocabulary);
        debug!(task, %specialty, "Classified follow-up task");
        Ok(specialty)
    }
}

fn classification_prompt(task: &str, vocabulary: &SpecialtyVocabulary) -> StructuredPrompt {
    let system = format!(
        "You route follow-up tasks from clinical appointment notes to the medical \
         specialty that should handle them. Answer with exactly one code from the \
         list below, or null when none of them applies.\n\nSpecialty codes:\n{}",
        vocabulary.prompt_listing()
    );
    StructuredPrompt {
        schema_name: "task_specialty".to_string(),
        system,
        user: format!("Task: {task}"),
        schema: classification_schema(vocabulary),
    }
}

fn classification_schema(vocabulary: &SpecialtyVocabulary) -> Value {
    let mut schema = strict_schema::<TaskSpecialty>();
    let mut options: Vec<Value> = vocabulary
        .codes()
        .map(|code| Value::String(code.to_string()))
        .collect();
    options.push(Value::Null);
    schema["properties"]["specialty"] = json!({
        "type": ["string", "null"],
        "enum": options,
    });
    schema
}

/// Anything that is not a vocabulary code becomes `"unknown"`.
fn interpret_answer(raw: &str, vocabulary: &SpecialtyVocabulary) -> String {
    let parsed: TaskSpecialty = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "Classifier reply is not the expected JSON");
            return UNKNOWN_SPECIALTY.to_string();
        }
    };

    let Some(token) = parsed.specialty.filter(|t| !t.trim().is_empty()) else {
        return UNKNOWN_SPECIALTY.to_string();
    };
    match vocabulary.validate(&token) {
        Ok(code) => code,
        Err(violation) => {
            warn!(%violation, "Classifier answered outside the vocabulary");
            UNKNOWN_SPECIALTY.to_string()
        }
    }
}
