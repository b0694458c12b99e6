//! Everything that talks to the external platform CLI.

pub mod command;
pub mod profile;
pub mod runner;
pub mod volume;
