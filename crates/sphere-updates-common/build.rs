//! ---
//! sphere_section: "01-core-functionality"
//! sphere_subsection: "module"
//! sphere_type: "source"
//! sphere_scope: "code"
//! sphere_description: "Shared primitives and utilities for the updater runtime."
//! sphere_version: "v0.1.0"
//! sphere_owner: "tbd"
//! ---
use vergen::EmitBuilder;

// No `fail_on_error`: source tarballs without a git checkout get placeholder values.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    EmitBuilder::builder().all_cargo().all_git().emit()?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
