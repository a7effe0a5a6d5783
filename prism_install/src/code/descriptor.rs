//! The compiled-code descriptor and its wire format.

use serde::{Deserialize, Serialize};

use super::{Assumption, MethodHandle, RawLocation, Reference, Site, ValueKind};
use crate::error::InstallError;

/// Entry bci of a normal (non-OSR) method compilation.
pub const INVOCATION_ENTRY_BCI: i32 = -1;

/// What the installed code will be registered as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeKind {
    /// Compiled Java method; `entry_bci != INVOCATION_ENTRY_BCI` is an OSR compilation.
    Method {
        method: MethodHandle,
        entry_bci: i32,
        compile_id: u32,
    },
    /// Runtime stub with no Java method of its own.
    Stub,
}

/// A constant the data section needs patched in at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSectionPatch {
    pub offset: u32,
    pub reference: Reference,
}

/// Free-form annotation attached to an instruction offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeComment {
    pub pc_offset: u32,
    pub text: String,
}

/// Target-independent description of one compilation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledCodeDescriptor {
    pub name: String,
    pub kind: CodeKind,
    /// Final instruction bytes, register-allocated and laid out.
    pub code: Vec<u8>,
    pub data_section: Vec<u8>,
    pub data_section_alignment: u32,
    pub data_section_patches: Vec<DataSectionPatch>,
    /// Sites in non-decreasing pc order.
    pub sites: Vec<Site>,
    pub assumptions: Vec<Assumption>,
    /// Methods whose bytecodes were inlined into this compilation.
    pub methods: Vec<MethodHandle>,
    pub comments: Vec<CodeComment>,
    pub total_frame_size: u32,
    /// Stack slot where deoptimization saves the original pc.
    pub deopt_rescue_slot: Option<RawLocation>,
    pub parameter_count: u32,
    pub has_wide_vector: bool,
    pub word_kind: ValueKind,
}

impl CompiledCodeDescriptor {
    /// A descriptor with no sites, data or assumptions.
    pub fn new(name: impl Into<String>, kind: CodeKind, code: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            code,
            data_section: Vec::new(),
            data_section_alignment: 8,
            data_section_patches: Vec::new(),
            sites: Vec::new(),
            assumptions: Vec::new(),
            methods: Vec::new(),
            comments: Vec::new(),
            total_frame_size: 0,
            deopt_rescue_slot: None,
            parameter_count: 0,
            has_wide_vector: false,
            word_kind: ValueKind::Long,
        }
    }

    /// Normal compilation of `method`.
    pub fn for_method(name: impl Into<String>, method: MethodHandle, code: Vec<u8>) -> Self {
        Self::new(
            name,
            CodeKind::Method {
                method,
                entry_bci: INVOCATION_ENTRY_BCI,
                compile_id: 0,
            },
            code,
        )
    }

    pub fn with_data_section(mut self, data: Vec<u8>, alignment: u32) -> Self {
        self.data_section = data;
        self.data_section_alignment = alignment;
        self
    }

    pub fn with_data_patch(mut self, offset: u32, reference: Reference) -> Self {
        self.data_section_patches
            .push(DataSectionPatch { offset, reference });
        self
    }

    pub fn with_site(mut self, site: Site) -> Self {
        self.sites.push(site);
        self
    }

    pub fn with_sites(mut self, sites: impl IntoIterator<Item = Site>) -> Self {
        self.sites.extend(sites);
        self
    }

    pub fn with_assumption(mut self, assumption: Assumption) -> Self {
        self.assumptions.push(assumption);
        self
    }

    pub fn with_inlined_method(mut self, method: MethodHandle) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_comment(mut self, pc_offset: u32, text: impl Into<String>) -> Self {
        self.comments.push(CodeComment {
            pc_offset,
            text: text.into(),
        });
        self
    }

    pub fn with_frame_size(mut self, total_frame_size: u32) -> Self {
        self.total_frame_size = total_frame_size;
        self
    }

    pub fn with_deopt_rescue_slot(mut self, offset: i32, add_frame_size: bool) -> Self {
        self.deopt_rescue_slot = Some(RawLocation::StackSlot {
            offset,
            add_frame_size,
        });
        self
    }

    pub fn with_parameter_count(mut self, parameter_count: u32) -> Self {
        self.parameter_count = parameter_count;
        self
    }

    /// Length of the constants section.
    #[inline]
    pub fn constants_size(&self) -> u32 {
        self.data_section.len() as u32
    }

    /// Decode a descriptor from its `bincode` wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, InstallError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Encode this descriptor into its `bincode` wire form.
    pub fn encode(&self) -> Result<Vec<u8>, InstallError> {
        Ok(bincode::serialize(self)?)
    }
}
