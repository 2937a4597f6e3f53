pub mod config;
pub mod identity;
pub mod logging;
pub mod messaging;
pub mod relay;
pub mod scheduler;
pub mod server;
