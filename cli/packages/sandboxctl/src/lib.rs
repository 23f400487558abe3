//! Local sandbox supervision and authenticated access to the management API.

pub mod cli;
pub mod paths;
pub mod ports;
pub mod process;
pub mod project;
pub mod prompt;
pub mod remote;
pub mod runtime;
pub mod sandbox;
pub mod session;
mod spinner;
pub mod supervisor;
