pub mod driver;
pub mod parser;
pub mod report;
pub mod runner;
pub mod secrets;
pub mod utils;

// Re-export common items
pub use parser::{load_test_cases, Step, TestCase};
pub use report::write_results;
pub use runner::{RunSummary, SuiteRunner};
