//! Build script for edgebus.
//!
//! Recompiles when migration files change so the `SQLx` `migrate!()` macro
//! picks up new versions of the rules schema.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
