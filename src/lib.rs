//! Channel relay: rule-driven forwarding between chat channels.

pub mod channels;
pub mod commands;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod settings;
pub mod store;
pub mod tasks;
