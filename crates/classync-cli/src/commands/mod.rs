//! Command handlers

pub mod config;
pub mod failures;
pub mod login;
pub mod record;
pub mod status;
pub mod sync;
