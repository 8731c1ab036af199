pub mod archive;
pub mod cancel;
pub mod config;
pub mod error;
pub mod install;
pub mod logging;
pub mod signing;

#[cfg(test)]
pub(crate) mod fixtures;
