use super::types::TestResults;
use crate::runner::state::{StepStatus, TestResult, TestStatus};
use anyhow::Result;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const JUNIT_FILE: &str = "junit.xml";

fn seconds(ms: u64) -> String {
    (ms as f64 / 1000.0).to_string()
}

/// Generate JUnit XML report string from TestResults
pub fn generate_junit_xml(results: &TestResults) -> Result<String> {
    let summary = &results.summary;
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let tests = summary.total.to_string();
    let failures = summary.failed.to_string();
    let skipped = summary.skipped.to_string();
    let time = seconds(summary.duration_ms);

    // <testsuites>
    let mut suites_start = BytesStart::new("testsuites");
    suites_start.push_attribute(("name", "story-tester-run"));
    suites_start.push_attribute(("tests", tests.as_str()));
    suites_start.push_attribute(("failures", failures.as_str()));
    suites_start.push_attribute(("skipped", skipped.as_str()));
    suites_start.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(suites_start))?;

    // One <testsuite> per run
    let timestamp = summary.started_at.to_rfc3339();
    let mut suite_start = BytesStart::new("testsuite");
    suite_start.push_attribute(("name", "user-stories"));
    suite_start.push_attribute(("tests", tests.as_str()));
    suite_start.push_attribute(("failures", failures.as_str()));
    suite_start.push_attribute(("skipped", skipped.as_str()));
    suite_start.push_attribute(("id", summary.session_id.as_str()));
    suite_start.push_attribute(("time", time.as_str()));
    suite_start.push_attribute(("timestamp", timestamp.as_str()));
    writer.write_event(Event::Start(suite_start))?;

    for result in &summary.results {
        write_test_case(&mut writer, result)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    let xml = String::from_utf8(writer.into_inner().into_inner())?;
    Ok(xml)
}

fn write_test_case<W: std::io::Write>(writer: &mut Writer<W>, result: &TestResult) -> Result<()> {
    let time = seconds(result.duration_ms);
    let mut case_start = BytesStart::new("testcase");
    case_start.push_attribute(("name", result.name.as_str()));
    case_start.push_attribute(("classname", "user-stories"));
    case_start.push_attribute(("time", time.as_str()));
    writer.write_event(Event::Start(case_start))?;

    match result.status {
        TestStatus::Failed => {
            let kind = result
                .error_kind
                .and_then(|k| serde_json::to_value(k).ok())
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "error".to_string());

            let mut fail_start = BytesStart::new("failure");
            fail_start.push_attribute(("message", result.error.as_deref().unwrap_or("Unknown error")));
            fail_start.push_attribute(("type", kind.as_str()));
            writer.write_event(Event::Start(fail_start))?;
            writer.write_event(Event::Text(BytesText::new(&step_log(result))))?;
            writer.write_event(Event::End(BytesEnd::new("failure")))?;
        }
        TestStatus::Skipped => {
            writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
        }
        TestStatus::Passed => {}
    }

    if let Some(path) = &result.screenshot_path {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&format!(
            "[[ATTACHMENT|{}]]",
            path
        ))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// One line per step: `[index] action status: message`
fn step_log(result: &TestResult) -> String {
    result
        .steps
        .iter()
        .map(|step| {
            let status = match step.status {
                StepStatus::Passed => "passed",
                StepStatus::Failed => "FAILED",
                StepStatus::Skipped => "skipped",
            };
            format!("[{}] {} {}: {}", step.step_index, step.action, status, step.message)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write `junit.xml` into `output_dir`
pub fn write_report(results: &TestResults, output_dir: &Path) -> Result<PathBuf> {
    let xml = generate_junit_xml(results)?;
    let path = output_dir.join(JUNIT_FILE);
    std::fs::write(&path, xml)?;
    Ok(path)
}
