pub mod types;
pub mod yaml;

use thiserror::Error;

pub use types::{Step, TestCase};
pub use yaml::{collect_test_files, load_test_cases, parse_test_cases, parse_test_file};

/// Problems found while turning generator output into test cases
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no test-case array found in input")]
    NoTestCases,

    #[error("test case #{index}: {reason}")]
    InvalidCase { index: usize, reason: String },

    #[error("test case '{case}', step {step}: unknown action '{action}'")]
    UnknownAction {
        case: String,
        step: usize,
        action: String,
    },

    #[error("test case '{case}', step {step}: {reason}")]
    InvalidStep {
        case: String,
        step: usize,
        reason: String,
    },
}
