//! ACME certificate acquisition.
//!
//! Wraps `instant-acme` for the protocol exchange and publishes HTTP-01 key
//! authorizations into a webroot directory the front proxy already serves.
//! That keeps the issuer a plain filesystem peer of the proxy: no listener
//! of its own, no port to fight over.
//!
//! # Flow
//!
//! 1. [`AcmeClient::connect`] loads or creates the ACME account, persisting
//!    credentials under the private storage directory.
//! 2. [`AcmeClient::order_certificate`] creates an order for all configured
//!    domains, publishes each challenge via [`WebrootChallenges`], polls the
//!    order to completion, and returns the issued material.
//! 3. The caller (the issuer loop) stages and atomically publishes the
//!    bundle; this module never touches the live bundle tree.

mod challenge;
mod client;
mod error;

pub use challenge::WebrootChallenges;
pub use client::{AcmeClient, IssuedCertificate};
pub use error::AcmeError;
