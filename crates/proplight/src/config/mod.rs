mod config;
mod diagnostics;

pub use config::*;
pub use diagnostics::Diagnostic;
pub use diagnostics::SourceInfo;
pub use diagnostics::ValidationError;
pub use diagnostics::Warning;
pub use diagnostics::format_diagnostics;
