#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared configuration model and naming conventions for `pywren-client`.

pub mod config;
pub mod keys;
