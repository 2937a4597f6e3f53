pub mod activity;
pub mod backend;
pub mod bot;
pub mod card;
pub mod connector;
pub mod error;
