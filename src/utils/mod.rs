//! Utility modules shared by the build and push routines.

pub mod exec;
pub mod git;
pub mod log;
pub mod slug;
