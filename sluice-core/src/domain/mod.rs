//! Domain types
//!
//! `pipeline` holds the declarative definition, `activity` the mutable run tree
//! built from it.

pub mod activity;
pub mod pipeline;
