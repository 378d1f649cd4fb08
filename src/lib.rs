//! Machine time library
//!
//! Gates machine access by card tap and meters usage against a two-tier
//! prepaid balance. Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
