//! layerscan CLI - inspect container images and scan their packages.

pub mod commands;
pub mod output;
