#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod error;
pub mod health;
pub mod hub;
pub mod membership;
pub mod names;
pub mod password;
pub mod presence;
pub mod registry;
pub mod sanitize;
pub mod session;
pub mod state;

#[cfg(test)]
mod connection_tests;
