//! Core types and trait definitions for the ResiliencePro profile bootstrap.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! profile store and the hosted identity provider are reached only through the
//! [`store::ProfileStore`] and [`session::SessionProvider`] traits; backends
//! live in their own crates.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod error;
pub mod identity;
pub mod memory;
pub mod monitor;
pub mod profile;
pub mod reconcile;
pub mod route;
pub mod session;
pub mod store;

pub use error::{Error, Result, Step};

#[cfg(test)]
mod tests;
