//! Read-only registry mapping a language tag to its launch recipe.

use std::collections::HashMap;

use thiserror::Error;

/// A single supported language's launch recipe.
///
/// `filename` is the fixed name the submitted source is written under inside
/// the workspace. `run_command` and `batch_run_command` are POSIX shell
/// fragments; the single-input fragment consumes stdin via `echo "$INPUT" |
/// ...`, the batch fragment is redirected from a per-case input file by the
/// batch driver instead.
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub tag: &'static str,
    pub filename: &'static str,
    pub compile_step: Option<&'static str>,
    pub run_command: &'static str,
    pub batch_run_command: &'static str,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

/// Immutable language registry, built once at startup.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: HashMap<&'static str, LanguageSpec>,
}

impl LanguageRegistry {
    /// The authoritative set of supported languages.
    pub fn new() -> Self {
        let specs = vec![
            LanguageSpec {
                tag: "python",
                filename: "main.py",
                compile_step: None,
                run_command: r#"echo "$INPUT" | python3 main.py"#,
                batch_run_command: r#"python3 main.py"#,
            },
            LanguageSpec {
                tag: "go",
                filename: "main.go",
                compile_step: None,
                run_command: r#"echo "$INPUT" | go run main.go"#,
                batch_run_command: r#"go run main.go"#,
            },
            LanguageSpec {
                tag: "c",
                filename: "main.c",
                compile_step: Some("gcc -O2 -o main main.c"),
                run_command: r#"gcc -O2 -o main main.c && echo "$INPUT" | ./main"#,
                batch_run_command: r#"./main"#,
            },
            LanguageSpec {
                tag: "cpp",
                filename: "main.cpp",
                compile_step: Some("g++ -O2 -o main main.cpp"),
                run_command: r#"g++ -O2 -o main main.cpp && echo "$INPUT" | ./main"#,
                batch_run_command: r#"./main"#,
            },
            LanguageSpec {
                tag: "java",
                filename: "Main.java",
                compile_step: Some("javac Main.java"),
                run_command: r#"javac Main.java && echo "$INPUT" | java Main"#,
                batch_run_command: r#"java Main"#,
            },
            LanguageSpec {
                tag: "javascript",
                filename: "main.js",
                compile_step: None,
                run_command: r#"echo "$INPUT" | node main.js"#,
                batch_run_command: r#"node main.js"#,
            },
        ];

        let mut languages = HashMap::with_capacity(specs.len());
        for spec in specs {
            languages.insert(spec.tag, spec);
        }
        Self { languages }
    }

    pub fn get(&self, tag: &str) -> Result<&LanguageSpec, RegistryError> {
        self.languages
            .get(tag)
            .ok_or_else(|| RegistryError::UnsupportedLanguage(tag.to_string()))
    }

    pub fn is_supported(&self, tag: &str) -> bool {
        self.languages.contains_key(tag)
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_the_authoritative_superset() {
        let registry = LanguageRegistry::new();
        for tag in ["python", "go", "c", "cpp", "java", "javascript"] {
            assert!(registry.is_supported(tag), "missing language {tag}");
        }
    }

    #[test]
    fn unknown_tag_fails_before_any_side_effect() {
        let registry = LanguageRegistry::new();
        let err = registry.get("cobol").unwrap_err();
        assert_eq!(err, RegistryError::UnsupportedLanguage("cobol".to_string()));
    }

    #[test]
    fn compiled_languages_carry_a_compile_step() {
        let registry = LanguageRegistry::new();
        assert!(registry.get("cpp").unwrap().compile_step.is_some());
        assert!(registry.get("python").unwrap().compile_step.is_none());
    }

    #[test]
    fn every_single_input_run_command_pipes_stdin_through_echo() {
        let registry = LanguageRegistry::new();
        for tag in ["python", "go", "c", "cpp", "java", "javascript"] {
            let spec = registry.get(tag).unwrap();
            assert!(
                spec.run_command.contains(r#"echo "$INPUT" |"#),
                "{tag}'s run_command does not pipe stdin via echo: {}",
                spec.run_command
            );
        }
    }
}
