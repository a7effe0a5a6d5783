//! Installer configuration.
//!
//! Describes the target the compiled code will run on and the limits the
//! installer enforces. One configuration is shared by every installation
//! request for a given runtime.

use std::fmt;

use thiserror::Error;

/// Instruction set the installed code targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// x86-64.
    Amd64,
    /// ARMv8-A, 64-bit.
    AArch64,
}

impl Architecture {
    /// Width of a machine word in bytes.
    #[inline]
    pub const fn word_size(self) -> u32 {
        8
    }

    /// Size of one instruction-stream alignment unit.
    #[inline]
    pub const fn instruction_alignment(self) -> u32 {
        match self {
            Architecture::Amd64 => 1,
            Architecture::AArch64 => 4,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Amd64 => write!(f, "amd64"),
            Architecture::AArch64 => write!(f, "aarch64"),
        }
    }
}

/// Configuration for the code installer.
///
/// # Example
///
/// ```ignore
/// use prism_install::{Architecture, InstallerConfig};
///
/// // Uncompressed heap references on AArch64
/// let config = InstallerConfig {
///     use_compressed_oops: false,
///     ..InstallerConfig::aarch64()
/// };
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerConfig {
    // =========================================================================
    // Target
    // =========================================================================
    /// Instruction set of the code being installed.
    ///
    /// Selects the relocation backend and the register numbering.
    ///
    /// Default: the host architecture when it is AArch64, otherwise AMD64
    pub arch: Architecture,

    /// Whether heap references may be embedded in 32-bit compressed form.
    ///
    /// When disabled, any compressed object constant or narrow oop location
    /// in a descriptor is rejected as malformed.
    ///
    /// Default: true
    pub use_compressed_oops: bool,

    /// Whether class pointers may be embedded in 32-bit compressed form.
    ///
    /// Default: true
    pub use_compressed_class_pointers: bool,

    // =========================================================================
    // Sizing
    // =========================================================================
    /// Upper bound on constants + instructions + stub space, in bytes.
    ///
    /// Larger requests fail with code-too-large before anything is
    /// reserved in the code cache.
    ///
    /// Default: 80000 words (640000 bytes)
    pub max_code_size: u32,

    /// Alignment of the instruction section inside the code object.
    ///
    /// Must be a power of two and at least the target's instruction
    /// alignment.
    ///
    /// Default: 32 (AMD64), 64 (AArch64)
    pub code_alignment: u32,

    // =========================================================================
    // Call Sites
    // =========================================================================
    /// Whether every Java method call must be preceded by an invoke mark.
    ///
    /// Both supported calling conventions need the invoke kind to pick a
    /// call relocation, so this is only relaxed for tests and stub code.
    ///
    /// Default: true
    pub require_invoke_mark: bool,

    // =========================================================================
    // Dependencies
    // =========================================================================
    /// Register an evolution dependency for every inlined method.
    ///
    /// Needed when the runtime supports redefining methods; installed code
    /// that inlined a redefined method must be invalidated.
    ///
    /// Default: false
    pub track_method_evolution: bool,
}

/// Default limit on the size of a single installed code object.
pub const DEFAULT_MAX_CODE_SIZE: u32 = 80_000 * 8;

impl Default for InstallerConfig {
    fn default() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::aarch64()
        } else {
            Self::amd64()
        }
    }
}

impl InstallerConfig {
    /// Configuration for x86-64 targets.
    pub fn amd64() -> Self {
        Self {
            arch: Architecture::Amd64,
            use_compressed_oops: true,
            use_compressed_class_pointers: true,
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            code_alignment: 32,
            require_invoke_mark: true,
            track_method_evolution: false,
        }
    }

    /// Configuration for AArch64 targets.
    pub fn aarch64() -> Self {
        Self {
            arch: Architecture::AArch64,
            code_alignment: 64,
            ..Self::amd64()
        }
    }

    /// Small limits and evolution tracking, for exercising failure paths.
    pub fn for_testing() -> Self {
        Self {
            max_code_size: 64 * 1024,
            code_alignment: 16,
            track_method_evolution: true,
            ..Self::amd64()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.code_alignment.is_power_of_two()
            || self.code_alignment < self.arch.instruction_alignment()
            || self.code_alignment > 4096
        {
            return Err(ConfigError::InvalidCodeAlignment(self.code_alignment));
        }
        if self.max_code_size < self.code_alignment || self.max_code_size > i32::MAX as u32 {
            return Err(ConfigError::InvalidMaxCodeSize(self.max_code_size));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Code alignment must be a power of two covering one instruction.
    #[error("code alignment {0} must be a power of two between the instruction size and 4096")]
    InvalidCodeAlignment(u32),
    /// Size limit must hold at least one aligned unit and fit a signed offset.
    #[error("max code size {0} is out of range")]
    InvalidMaxCodeSize(u32),
}
