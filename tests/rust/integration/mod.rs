//! Integration tests - end-to-end compilation against YAML-declared schemas
//!
//! These tests drive the public builder API the way a query front-end would
//! and check the rendered SQL and row mappings.

mod common;
mod configuration_tests;
mod query_compilation_tests;
