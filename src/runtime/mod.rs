//! Platform transport: the Runtime API client and the polling loop that feeds it.

pub mod api;
mod bootstrap;

pub use api::{ErrorReport, NextInvocation, RuntimeApiClient};
pub use bootstrap::{Bootstrap, RuntimeBootstrap};
