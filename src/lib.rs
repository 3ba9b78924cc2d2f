pub mod bus;
pub mod config;
pub mod errors;
pub mod logging;
pub mod process;
pub mod registry;
pub mod server;
pub mod service;
pub mod session;

pub use bus::{LogEventBus, LogSubscription, OverflowPolicy};
pub use errors::{BuildError, PublishError};
pub use registry::SessionRegistry;
pub use service::BuildService;
