//! # IO Module
//!
//! Interface layer that exposes the domain services to clients. Currently
//! only the REST API in [`rest`].

pub mod rest;

pub use rest::*;
