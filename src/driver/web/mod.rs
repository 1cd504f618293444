mod driver;

pub use driver::{BrowserType, PlaywrightLauncher, PlaywrightSession, WebDriverConfig};
