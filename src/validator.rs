//! Pre-admission checks. Rejections here never reach the Dispatch Engine.

use thiserror::Error;

use crate::batch::{is_valid_test_case_id, TestInput};
use crate::language::LanguageRegistry;

pub const MAX_CODE_BYTES: usize = 1024 * 1024;
pub const MAX_INPUT_BYTES: usize = 1024 * 1024;
pub const MAX_BATCH_CASES: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("code must not be empty")]
    EmptyCode,
    #[error("code exceeds the 1 MiB size limit")]
    CodeTooLarge,
    #[error("input exceeds the 1 MiB size limit")]
    InputTooLarge,
    #[error("batch submission must include at least one test case")]
    EmptyBatch,
    #[error("batch submission exceeds the 100 test case limit")]
    TooManyTestCases,
    #[error("test case id {0:?} must be a non-empty string of letters, digits, '_' or '-'")]
    InvalidTestCaseId(String),
}

#[derive(Debug, Clone)]
pub struct Validator<'a> {
    registry: &'a LanguageRegistry,
}

impl<'a> Validator<'a> {
    pub fn new(registry: &'a LanguageRegistry) -> Self {
        Self { registry }
    }

    pub fn validate_execute(
        &self,
        language: &str,
        code: &str,
        input: Option<&str>,
    ) -> Result<(), ValidationError> {
        self.validate_common(language, code)?;
        if let Some(input) = input {
            if input.len() > MAX_INPUT_BYTES {
                return Err(ValidationError::InputTooLarge);
            }
        }
        Ok(())
    }

    pub fn validate_batch(
        &self,
        language: &str,
        code: &str,
        cases: &[TestInput],
    ) -> Result<(), ValidationError> {
        self.validate_common(language, code)?;
        if cases.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if cases.len() > MAX_BATCH_CASES {
            return Err(ValidationError::TooManyTestCases);
        }
        for case in cases {
            if !is_valid_test_case_id(&case.id) {
                return Err(ValidationError::InvalidTestCaseId(case.id.clone()));
            }
        }
        Ok(())
    }

    fn validate_common(&self, language: &str, code: &str) -> Result<(), ValidationError> {
        if !self.registry.is_supported(language) {
            return Err(ValidationError::UnsupportedLanguage(language.to_string()));
        }
        if code.is_empty() {
            return Err(ValidationError::EmptyCode);
        }
        if code.len() > MAX_CODE_BYTES {
            return Err(ValidationError::CodeTooLarge);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_mib_is_accepted_one_byte_more_is_rejected() {
        let registry = LanguageRegistry::new();
        let validator = Validator::new(&registry);

        let at_limit = "a".repeat(MAX_CODE_BYTES);
        assert!(validator.validate_execute("python", &at_limit, None).is_ok());

        let over_limit = "a".repeat(MAX_CODE_BYTES + 1);
        assert_eq!(
            validator.validate_execute("python", &over_limit, None),
            Err(ValidationError::CodeTooLarge)
        );
    }

    fn cases_of(n: usize) -> Vec<TestInput> {
        (0..n)
            .map(|i| TestInput {
                id: i.to_string(),
                input: String::new(),
            })
            .collect()
    }

    #[test]
    fn one_hundred_cases_accepted_one_hundred_one_rejected() {
        let registry = LanguageRegistry::new();
        let validator = Validator::new(&registry);

        assert!(validator
            .validate_batch("python", "print(1)", &cases_of(100))
            .is_ok());
        assert_eq!(
            validator.validate_batch("python", "print(1)", &cases_of(101)),
            Err(ValidationError::TooManyTestCases)
        );
    }

    #[test]
    fn test_case_id_with_shell_metacharacters_is_rejected() {
        let registry = LanguageRegistry::new();
        let validator = Validator::new(&registry);
        let cases = vec![TestInput {
            id: "1'; rm -rf /".to_string(),
            input: String::new(),
        }];
        assert_eq!(
            validator.validate_batch("python", "print(1)", &cases),
            Err(ValidationError::InvalidTestCaseId("1'; rm -rf /".to_string()))
        );
    }

    #[test]
    fn empty_code_is_rejected() {
        let registry = LanguageRegistry::new();
        let validator = Validator::new(&registry);
        assert_eq!(
            validator.validate_execute("python", "", None),
            Err(ValidationError::EmptyCode)
        );
    }

    #[test]
    fn empty_batch_is_rejected() {
        let registry = LanguageRegistry::new();
        let validator = Validator::new(&registry);
        assert_eq!(
            validator.validate_batch("python", "print(1)", &[]),
            Err(ValidationError::EmptyBatch)
        );
    }

    #[test]
    fn unknown_language_is_rejected_before_anything_else() {
        let registry = LanguageRegistry::new();
        let validator = Validator::new(&registry);
        assert_eq!(
            validator.validate_execute("brainfuck", "+++", None),
            Err(ValidationError::UnsupportedLanguage("brainfuck".to_string()))
        );
    }
}
