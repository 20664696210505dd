//! Command implementations for the Callsheet CLI.

pub mod check;
pub mod id;
pub mod run;
