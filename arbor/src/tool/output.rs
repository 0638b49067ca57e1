//! Structured-output validation.
//!
//! The output tool captures a run's structured result: its argument
//! schema is compiled once per run and every call to it is validated,
//! with bounded retries handled by the step loop.

use jsonschema::Validator;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::manifest::OutputToolDef;

/// A compiled validator for the output tool's argument schema.
pub struct OutputValidator {
    name: String,
    validator: Validator,
}

impl OutputValidator {
    /// Compile the validator from an output tool definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] when the schema itself is invalid.
    pub fn compile(def: &OutputToolDef) -> Result<Self> {
        let validator = jsonschema::validator_for(&def.schema).map_err(|err| {
            Error::bad_request(format!(
                "output tool '{}' has an invalid schema: {err}",
                def.name
            ))
        })?;
        Ok(Self {
            name: def.name.clone(),
            validator,
        })
    }

    /// Name of the output tool.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate a call's input against the schema. On failure, returns
    /// every violation joined into one message.
    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl std::fmt::Debug for OutputValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputValidator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
