//! Build script for the chatrelay crate.
//!
//! Ensures the crate is recompiled when migration files change, which `sqlx::migrate!()`
//! needs to detect schema changes at compile time.

/// Main build script entry point.
///
/// Tells Cargo to rerun the build when files in the migrations directory change,
/// which is required for the `SQLx` migration system to work properly.
fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
