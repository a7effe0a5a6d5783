//! Code installer for Prism's optimizing compiler.
//!
//! Takes the target-independent description of freshly compiled code
//! produced by an external compiler and turns it into an installed code
//! object with everything the runtime needs to run it safely:
//! - Patched instruction bytes (calls, constants, data-section references)
//! - Oop maps for every safepoint
//! - Scope records for deoptimization and stack walking
//! - An exception handler table and a dependency list
//!
//! # Example
//!
//! ```ignore
//! use prism_install::{install, InstallerConfig};
//! use prism_install::runtime::local::LocalRuntime;
//!
//! let runtime = LocalRuntime::new(16 * 1024 * 1024);
//! let installed = install(&InstallerConfig::amd64(), &runtime, &descriptor)?;
//! println!("installed {} at {:#x}", installed.name(), installed.base());
//! ```
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod buffer;
pub mod code;
pub mod config;
pub mod debug;
pub mod dependencies;
pub mod error;
pub mod exceptions;
pub mod finalizer;
pub mod installer;
pub mod oopmap;
pub mod reloc;
pub mod runtime;

pub use code::CompiledCodeDescriptor;
pub use config::{Architecture, ConfigError, InstallerConfig};
pub use error::{InstallError, InstallResult};
pub use finalizer::{CodeObject, InstalledCode};
pub use installer::{CodeInstaller, InstallOutcome, install, install_outcome, install_serialized};
