use super::types::TestResults;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const RESULTS_FILE: &str = "results.json";

/// Write `results.json` into `output_dir`
pub fn write_report(results: &TestResults, output_dir: &Path) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(results)?;
    let path = output_dir.join(RESULTS_FILE);
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Load a previously written `results.json`
pub fn read_report(path: &Path) -> Result<TestResults> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}
