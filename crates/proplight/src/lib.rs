pub mod api;
pub mod config;
pub mod engine;
pub mod group;
pub mod simulator;

pub use config::Config;
pub use config::Diagnostic;
pub use config::LogLevel;
pub use config::format_diagnostics;
pub use engine::Engine;
pub use engine::GroupHandle;
pub use engine::GroupSnapshot;
pub use simulator::SimulatedRegistry;
