//! Sectioned code buffer.
//!
//! The buffer is sized once, before any patching, and laid out as
//!
//! ```text
//! +-----------+---------------+---------------------+
//! | constants | instructions  | stubs (estimated)   |
//! +-----------+---------------+---------------------+
//! ^ base      ^ aligned       ^ word aligned
//! ```
//!
//! All writes after sizing are bounds-checked overwrites; the length never
//! changes. Stub space is handed out bump-style from the estimate made up
//! front, and running past it is a code-too-large failure.

use crate::error::InstallError;

/// Alignment of the stub section and of every stub in it.
pub const STUB_ALIGNMENT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Constants,
    Instructions,
    Stubs,
}

/// Sizes and alignments the buffer is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub constants_size: u32,
    pub constants_alignment: u32,
    pub instructions_size: u32,
    pub instructions_alignment: u32,
    pub stub_capacity: u32,
}

impl BufferLayout {
    /// Offset of the instruction section from the buffer start.
    #[inline]
    pub fn instructions_start(&self) -> u64 {
        align_up(self.constants_size as u64, self.instructions_alignment.max(1) as u64)
    }

    #[inline]
    pub fn stubs_start(&self) -> u64 {
        align_up(
            self.instructions_start() + self.instructions_size as u64,
            STUB_ALIGNMENT as u64,
        )
    }

    /// Total bytes including alignment padding.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.stubs_start() + self.stub_capacity as u64
    }

    /// Alignment the whole buffer needs from the allocator.
    #[inline]
    pub fn base_alignment(&self) -> u32 {
        self.constants_alignment
            .max(self.instructions_alignment)
            .max(STUB_ALIGNMENT)
    }
}

#[inline]
pub(crate) const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// Code Buffer
// =============================================================================

#[derive(Debug, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    constants: (u32, u32),
    instructions: (u32, u32),
    stubs_start: u32,
    stub_capacity: u32,
    stubs_used: u32,
    /// Address the buffer will live at once committed.
    base: u64,
}

impl CodeBuffer {
    /// Create a zero-filled buffer for `layout`.
    ///
    /// The caller checks `layout.total_size()` against its limits first.
    pub fn new(layout: &BufferLayout) -> Self {
        let insts_start = layout.instructions_start() as u32;
        let stubs_start = layout.stubs_start() as u32;
        Self {
            bytes: vec![0; layout.total_size() as usize],
            constants: (0, layout.constants_size),
            instructions: (insts_start, layout.instructions_size),
            stubs_start,
            stub_capacity: layout.stub_capacity,
            stubs_used: 0,
            base: 0,
        }
    }

    /// Set the address the buffer has been reserved at.
    #[inline]
    pub fn set_base(&mut self, base: u64) {
        self.base = base;
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Offset of `section` from the start of the buffer.
    #[inline]
    pub fn section_start(&self, section: Section) -> u32 {
        match section {
            Section::Constants => self.constants.0,
            Section::Instructions => self.instructions.0,
            Section::Stubs => self.stubs_start,
        }
    }

    /// Bytes currently in use by `section`.
    #[inline]
    pub fn section_len(&self, section: Section) -> u32 {
        match section {
            Section::Constants => self.constants.1,
            Section::Instructions => self.instructions.1,
            Section::Stubs => self.stubs_used,
        }
    }

    #[inline]
    pub fn section(&self, section: Section) -> &[u8] {
        let start = self.section_start(section) as usize;
        &self.bytes[start..start + self.section_len(section) as usize]
    }

    /// Absolute address of `offset` within `section`.
    #[inline]
    pub fn address_of(&self, section: Section, offset: u32) -> u64 {
        self.base + self.section_start(section) as u64 + offset as u64
    }

    #[inline]
    pub fn stub_capacity(&self) -> u32 {
        self.stub_capacity
    }

    /// Total length, including unused stub space.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn range(&self, section: Section, offset: u32, len: u32) -> Result<usize, InstallError> {
        let limit = match section {
            Section::Stubs => self.stub_capacity,
            other => self.section_len(other),
        };
        if (offset as u64) + (len as u64) > limit as u64 {
            return Err(InstallError::BufferOverrun {
                section,
                offset,
                len,
            });
        }
        Ok(self.section_start(section) as usize + offset as usize)
    }

    /// Copy `bytes` to the start of `section`, which must be exactly that long.
    pub fn fill(&mut self, section: Section, bytes: &[u8]) -> Result<(), InstallError> {
        if bytes.len() != self.section_len(section) as usize {
            return Err(InstallError::BufferOverrun {
                section,
                offset: 0,
                len: bytes.len() as u32,
            });
        }
        self.patch(section, 0, bytes)
    }

    pub fn read(&self, section: Section, offset: u32, len: u32) -> Result<&[u8], InstallError> {
        let start = self.range(section, offset, len)?;
        Ok(&self.bytes[start..start + len as usize])
    }

    /// Read up to `len` bytes, stopping at the end of the section.
    pub fn read_available(&self, section: Section, offset: u32, len: u32) -> &[u8] {
        let section_len = match section {
            Section::Stubs => self.stub_capacity,
            other => self.section_len(other),
        };
        let end = section_len.min(offset.saturating_add(len));
        let start = self.section_start(section) as usize;
        if offset >= end {
            return &[];
        }
        &self.bytes[start + offset as usize..start + end as usize]
    }

    pub fn read_u32(&self, section: Section, offset: u32) -> Result<u32, InstallError> {
        let bytes = self.read(section, offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Overwrite `bytes` at `offset` within `section`.
    pub fn patch(
        &mut self,
        section: Section,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), InstallError> {
        let start = self.range(section, offset, bytes.len() as u32)?;
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn write_u32(
        &mut self,
        section: Section,
        offset: u32,
        value: u32,
    ) -> Result<(), InstallError> {
        self.patch(section, offset, &value.to_le_bytes())
    }

    #[inline]
    pub fn write_u64(
        &mut self,
        section: Section,
        offset: u32,
        value: u64,
    ) -> Result<(), InstallError> {
        self.patch(section, offset, &value.to_le_bytes())
    }

    /// Carve `size` bytes out of the stub section; returns the stub's offset.
    pub fn alloc_stub(&mut self, size: u32) -> Result<u32, InstallError> {
        let offset = align_up(self.stubs_used as u64, STUB_ALIGNMENT as u64) as u32;
        let available = self.stub_capacity.saturating_sub(offset);
        if size > available {
            return Err(InstallError::StubSpaceExceeded {
                requested: size,
                available,
            });
        }
        self.stubs_used = offset + size;
        Ok(offset)
    }

    /// Final bytes: constants, instructions and the used part of stub space.
    pub fn into_bytes(mut self) -> Box<[u8]> {
        let end = self.stubs_start as usize + self.stubs_used as usize;
        self.bytes.truncate(end);
        self.bytes.into_boxed_slice()
    }
}

// =============================================================================
// Tests
// =============================================================================
