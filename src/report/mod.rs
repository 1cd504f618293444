pub mod json;
pub mod junit;
pub mod types;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::runner::state::RunSummary;

/// Write `results.json` and `junit.xml` for a finished run
pub fn write_results(summary: &RunSummary, output_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;
    let results = types::TestResults::new(summary);
    Ok(vec![
        json::write_report(&results, output_dir)?,
        junit::write_report(&results, output_dir)?,
    ])
}

/// Regenerate a report from a saved `results.json`
pub fn generate_report(results_path: &Path, format: &str, output: Option<&Path>) -> Result<()> {
    let results = json::read_report(results_path)?;

    let rendered = match format {
        "json" => serde_json::to_string_pretty(&results)?,
        "junit" => junit::generate_junit_xml(&results)?,
        _ => anyhow::bail!("Unknown format: {}", format),
    };

    match output {
        Some(path) => {
            std::fs::write(path, rendered)?;
            println!("Report saved to: {}", path.display());
        }
        None => println!("{}", rendered),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_write_results_creates_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/out");
        let summary = RunSummary::new("run", vec![], Utc::now(), 0);

        let written = write_results(&summary, &output).unwrap();
        assert_eq!(written.len(), 2);
        assert!(output.join(json::RESULTS_FILE).exists());
        assert!(output.join(junit::JUNIT_FILE).exists());

        let regenerated = output.join("again.xml");
        generate_report(&output.join(json::RESULTS_FILE), "junit", Some(&regenerated)).unwrap();
        assert!(std::fs::read_to_string(regenerated)
            .unwrap()
            .contains("story-tester-run"));
        assert!(generate_report(&output.join(json::RESULTS_FILE), "html", None).is_err());
    }
}
