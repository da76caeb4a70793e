#![warn(
    unused_extern_crates,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

pub mod bitcoin;
pub mod broadcast;
pub mod chain;
pub mod command;
pub mod config;
pub mod database;
pub mod env;
pub mod error;
pub mod fs;
pub mod index;
pub mod ledger;
pub mod metrics;
pub mod trace;
pub mod wallet;
pub mod webhook;

pub use error::Error;
