//! Database module
//!
//! Provides SQLite-backed persistence for repositories, revision markers,
//! review tasks, issues, and the settings store (C1/C2 plus the ambient
//! settings table described in Design Note §9).

pub mod core;

pub use core::*;
