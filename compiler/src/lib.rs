pub mod config;
pub mod escape;
pub mod ir;
pub mod logging;

pub use config::{ConfigError, EscapeConfig};
pub use escape::{EscapeAnalysis, EscapeAnalysisError, EscapeAnalysisResults};
