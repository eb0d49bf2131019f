//! Release builder: resolve, build, validate, publish and branch a release assembled
//! from many source repositories.
pub mod auth;
pub mod branch;
pub mod build;
pub mod command;
pub mod config;
pub mod files;
pub mod git;
pub mod makevar;
pub mod manifest;
pub mod model;
pub mod publish;
pub mod retry;
pub mod source;
pub mod validate;
