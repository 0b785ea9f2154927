//! Side effects: the agent and tool collaborators, prompts, git, and files on disk.

pub mod agent;
pub mod config;
pub mod git;
pub mod process;
pub mod prompt;
pub mod repository;
pub mod task;
pub mod tools;
