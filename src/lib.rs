#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod health;
pub mod image;
pub mod logging;
pub mod machine;
pub mod network;
pub mod orchestrator;
pub mod paths;
pub mod probe;
pub mod progress;
pub mod remote;
pub mod resolve;
pub mod runner;
pub mod spec;
pub mod template;
pub mod topology;
