//! `pw-fleet` binary: JSON account file, external or built-in task bodies,
//! Chromium session hosts, and signal-driven shutdown.

pub mod cli;
pub mod config;
pub mod logging;
pub mod run;
pub mod store;
pub mod tasks;
