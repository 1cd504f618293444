pub mod case;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod locator;
pub mod login_flow;
pub mod state;
pub mod suite;

pub use case::CaseRunner;
pub use context::ExecutionContext;
pub use error::{ActionError, ErrorKind, LocatorError, LoginPhase};
pub use events::*;
pub use executor::execute;
pub use locator::{locate, Located};
pub use state::*;
pub use suite::SuiteRunner;
