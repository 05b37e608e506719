//! Integration test infrastructure for the Handle System crates.
//!
//! Provides a [`TestNetwork`] of in-process sites (a root service plus one
//! site per naming authority) listening on loopback ports, and the
//! [`TestSite`] they are made of.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod harness;
pub mod site;

pub use harness::TestNetwork;
pub use site::{TestSite, TestSiteConfig};
