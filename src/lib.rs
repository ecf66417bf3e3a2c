#![forbid(unsafe_code)]

//! Ranking and caching core of the newtube feed backend.

pub mod cache;
pub mod channel;
pub mod config;
pub mod content;
pub mod logging;
pub mod ranking;
pub mod upstream;
