use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::types::{Step, Target, TestCase};
use super::ParseError;

/// Parse a test-case file (JSON or YAML, raw generator output accepted)
pub fn parse_test_file(path: &Path, strict: bool) -> Result<Vec<TestCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;

    parse_test_cases(&content, strict).with_context(|| format!("Invalid test file: {}", path.display()))
}

const TEST_FILE_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "txt", "md"];

/// Test-case files under `path`: the file itself, or every matching file in
/// the directory tree, sorted for a stable run order
pub fn collect_test_files(path: &Path) -> Vec<PathBuf> {
    if !path.is_dir() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| TEST_FILE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Parse every test-case file under `path`, in file order
pub fn load_test_cases(path: &Path, strict: bool) -> Result<Vec<TestCase>> {
    let files = collect_test_files(path);
    if files.is_empty() {
        anyhow::bail!("No test files found in {}", path.display());
    }
    let mut cases = Vec::new();
    for file in files {
        cases.extend(parse_test_file(&file, strict)?);
    }
    Ok(cases)
}

/// Parse test cases out of generator output.
///
/// Accepts a bare array, an object with a `tests` array, or either of those
/// wrapped in a Markdown code fence or surrounded by prose. With `strict`
/// unset, unknown action kinds are kept as [`Step::Unknown`] instead of
/// rejecting the whole input.
pub fn parse_test_cases(content: &str, strict: bool) -> Result<Vec<TestCase>, ParseError> {
    let raw = locate_cases(content).ok_or(ParseError::NoTestCases)?;

    raw.iter()
        .enumerate()
        .map(|(i, case)| parse_case(case, i + 1, strict))
        .collect()
}

/// Try the content as-is, then the body of a code fence, then the outermost brackets
fn locate_cases(content: &str) -> Option<Vec<Value>> {
    let candidates = [
        Some(content.trim()),
        strip_code_fence(content),
        outermost_array(content),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(|text| serde_yaml::from_str::<Value>(text).ok())
        .find_map(cases_array)
}

fn cases_array(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("tests") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the language tag line
    let body = &after[after.find('\n').map(|i| i + 1).unwrap_or(after.len())..];
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].trim())
}

fn outermost_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_case(value: &Value, index: usize, strict: bool) -> Result<TestCase, ParseError> {
    let obj = value.as_object().ok_or_else(|| ParseError::InvalidCase {
        index,
        reason: "expected an object with 'name' and 'steps'".into(),
    })?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Test {}", index));

    let raw_steps = obj
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::InvalidCase {
            index,
            reason: format!("'{}' has no 'steps' array", name),
        })?;

    let steps = raw_steps
        .iter()
        .enumerate()
        .map(|(i, step)| parse_step(step, &name, i + 1, strict))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TestCase { name, steps })
}

fn parse_step(value: &Value, case: &str, step: usize, strict: bool) -> Result<Step, ParseError> {
    let invalid = |reason: String| ParseError::InvalidStep {
        case: case.to_string(),
        step,
        reason,
    };

    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing 'action'".into()))?;

    if !Step::KNOWN_ACTIONS.contains(&action) {
        if strict {
            return Err(ParseError::UnknownAction {
                case: case.to_string(),
                step,
                action: action.to_string(),
            });
        }
        log::warn!("{}: step {} has unknown action '{}'", case, step, action);
        return Ok(Step::Unknown {
            name: action.to_string(),
        });
    }

    let mut value = value.clone();
    if Step::VISIBILITY_ACTIONS.contains(&action) {
        if let Some(fields) = value.as_object_mut() {
            fields.entry("visible").or_insert(Value::Bool(true));
        }
    }

    let parsed: Step = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
    validate(&parsed).map_err(|reason| invalid(reason.to_string()))?;
    Ok(parsed)
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

fn no_target(target: &Option<Target>) -> bool {
    target.as_ref().map_or(true, Target::is_empty)
}

/// Field combinations serde cannot express
fn validate(step: &Step) -> Result<(), &'static str> {
    match step {
        Step::Click { selector, text, .. } if no_target(selector) && is_blank(text) => {
            Err("click needs a selector or text")
        }
        Step::WaitFor { selector, text, .. } if no_target(selector) && is_blank(text) => {
            Err("wait_for needs a selector or text")
        }
        Step::AssertText {
            selector, expected, ..
        } if no_target(selector) && is_blank(expected) => Err("assert_text needs text or a selector"),
        Step::Fill { selector, .. }
        | Step::FillEnv { selector, .. }
        | Step::FillTotp { selector, .. }
        | Step::AssertElement { selector, .. }
            if selector.is_empty() =>
        {
            Err("selector must not be empty")
        }
        Step::FillTotp { env, secret, .. } if is_blank(env) && is_blank(secret) => {
            Err("fill_totp needs env or secret")
        }
        Step::ClickText { text, .. } if text.trim().is_empty() => Err("click_text needs text"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_array() {
        let cases = parse_test_cases(
            r##"[{"name": "Login works", "steps": [
                {"action": "navigate", "url": "https://ex.test"},
                {"action": "click_text", "text": "Login"},
                {"action": "fill", "selector": "#email", "value": "a@b.com"}
            ]}]"##,
            true,
        )
        .unwrap();

        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].name, "Login works");
        assert_eq!(cases[0].steps.len(), 3);
        assert_eq!(cases[0].steps[1].action_name(), "click_text");
    }

    #[test]
    fn test_parse_fenced_generator_output() {
        let content = r#"Sure! Here are the tests:

```json
{"tests": [{"steps": [{"action": "screenshot"}]}]}
```
Let me know if you need more."#;
        let cases = parse_test_cases(content, true).unwrap();
        assert_eq!(cases[0].name, "Test 1");
        assert_eq!(cases[0].steps, vec![Step::Screenshot { label: None }]);
    }

    #[test]
    fn test_parse_prose_wrapped_array() {
        let content = "The cases are [{\"name\": \"A\", \"steps\": []}] as requested.";
        let cases = parse_test_cases(content, true).unwrap();
        assert_eq!(cases[0].name, "A");
        assert!(cases[0].steps.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let content = r##"
- name: Studies page
  steps:
    - action: navigate
      url: /studies
    - action: assert_element_present
      target: "#study-list"
"##;
        let cases = parse_test_cases(content, true).unwrap();
        assert_eq!(cases[0].steps[1].action_name(), "assert_element");
    }

    #[test]
    fn test_parse_generator_step_shapes() {
        let content = r##"
- name: Profile
  steps:
    - action: navigate_to
      target: /profile
    - action: click
      target:
        role: button
        name: Edit profile
    - action: fill
      selector:
        type: testid
        value: display-name
      value: Ada
    - action: assert_element_visible
      target: save-button
    - action: assert
      target: "#saved"
      visible: false
    - action: assert_element_presence
      target: "[data-qa='toast']"
"##;
        let steps = &parse_test_cases(content, true).unwrap()[0].steps;
        assert_eq!(steps[0].display_name(), "navigate /profile");
        assert_eq!(steps[2].display_name(), "fill data-testid=display-name");
        assert!(matches!(&steps[3], Step::AssertElement { visible: true, .. }));
        // An explicit field beats the alias default
        assert!(matches!(&steps[4], Step::AssertElement { visible: false, .. }));
        assert!(matches!(&steps[5], Step::AssertElement { visible: false, present: true, .. }));
    }

    #[test]
    fn test_assert_text_needs_something_to_check() {
        let content = r#"[{"name": "T", "steps": [{"action": "assert_text_present"}]}]"#;
        let err = parse_test_cases(content, true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "test case 'T', step 1: assert_text needs text or a selector"
        );
    }

    #[test]
    fn test_unknown_action_strict_vs_lenient() {
        let content = r#"[{"name": "T", "steps": [{"action": "hover", "selector": "a"}]}]"#;

        let err = parse_test_cases(content, true).unwrap_err();
        assert_eq!(err.to_string(), "test case 'T', step 1: unknown action 'hover'");

        let cases = parse_test_cases(content, false).unwrap();
        assert_eq!(
            cases[0].steps[0],
            Step::Unknown {
                name: "hover".into()
            }
        );
    }

    #[test]
    fn test_validation_names_case_and_step() {
        let content = r##"[{"name": "T", "steps": [
            {"action": "navigate", "url": "/"},
            {"action": "fill_totp", "selector": "#otp"}
        ]}]"##;
        let err = parse_test_cases(content, true).unwrap_err();
        assert_eq!(
            err.to_string(),
            "test case 'T', step 2: fill_totp needs env or secret"
        );

        let content = r#"[{"name": "T", "steps": [{"action": "click"}]}]"#;
        assert!(matches!(
            parse_test_cases(content, true),
            Err(ParseError::InvalidStep { step: 1, .. })
        ));
    }

    #[test]
    fn test_missing_steps_and_garbage() {
        assert!(matches!(
            parse_test_cases(r#"[{"name": "T"}]"#, true),
            Err(ParseError::InvalidCase { index: 1, .. })
        ));
        assert!(matches!(
            parse_test_cases("no tests here", true),
            Err(ParseError::NoTestCases)
        ));
    }

    #[test]
    fn test_parse_test_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cases.json");
        std::fs::write(&path, r#"[{"name": "T", "steps": [{"action": "screenshot", "name": "home"}]}]"#)
            .unwrap();

        let cases = parse_test_file(&path, true).unwrap();
        assert_eq!(
            cases[0].steps[0],
            Step::Screenshot {
                label: Some("home".into())
            }
        );
        assert!(parse_test_file(&dir.path().join("missing.json"), true).is_err());
    }

    #[test]
    fn test_load_directory_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "- name: second\n  steps:\n    - action: screenshot\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("nested/a.json"),
            r#"[{"name": "first", "steps": [{"action": "screenshot"}]}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.png"), "not a test").unwrap();

        let files = collect_test_files(dir.path());
        assert_eq!(files.len(), 2);

        let names: Vec<_> = load_test_cases(dir.path(), true)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["second", "first"]);

        let empty = tempfile::tempdir().unwrap();
        assert!(load_test_cases(empty.path(), true).is_err());
    }
}
