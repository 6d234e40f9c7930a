mod controller;
mod engine;
pub mod message;
pub mod registry;
pub mod state;

pub use controller::ControllerError;
pub use controller::ControllerSettings;
pub use controller::GroupController;
pub use controller::GroupHandle;
pub use controller::Membership;
pub use controller::Phase;
pub use engine::Engine;
pub use engine::Group;
pub use message::CommandReport;
pub use message::GroupCommand;
pub use message::TurnOn;
pub use registry::DeviceRegistry;
pub use registry::EventBus;
pub use registry::LocalEventBus;
pub use state::Capability;
pub use state::DeviceSnapshot;
pub use state::GroupSnapshot;
