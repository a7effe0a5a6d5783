//! Exception handler table.

/// A throwing pc and the handler it unwinds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandlerEntry {
    pub pc_offset: u32,
    pub handler_offset: u32,
}

/// Handler entries in site order.
///
/// Several entries may share a pc; they are kept in the order the sites
/// listed them and the runtime tries them in that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionHandlerTable {
    entries: Vec<ExceptionHandlerEntry>,
}

impl ExceptionHandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Callers add entries in non-decreasing pc order.
    pub fn add(&mut self, pc_offset: u32, handler_offset: u32) {
        self.entries.push(ExceptionHandlerEntry {
            pc_offset,
            handler_offset,
        });
    }

    #[inline]
    pub fn entries(&self) -> &[ExceptionHandlerEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handler offsets registered for `pc_offset`, in table order.
    pub fn handlers_at(&self, pc_offset: u32) -> impl Iterator<Item = u32> + '_ {
        let start = self.entries.partition_point(|e| e.pc_offset < pc_offset);
        self.entries[start..]
            .iter()
            .take_while(move |e| e.pc_offset == pc_offset)
            .map(|e| e.handler_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_pcs_keep_order() {
        let mut table = ExceptionHandlerTable::new();
        table.add(4, 40);
        table.add(8, 80);
        table.add(8, 60);
        table.add(12, 80);

        assert_eq!(table.handlers_at(8).collect::<Vec<_>>(), vec![80, 60]);
        assert_eq!(table.handlers_at(4).collect::<Vec<_>>(), vec![40]);
        assert_eq!(table.handlers_at(6).count(), 0);
        assert_eq!(table.len(), 4);
    }
}
