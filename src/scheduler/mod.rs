pub mod notifier;
pub mod service;
