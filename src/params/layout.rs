use std::{collections::HashMap, ops::Range};

use crate::initialization::ParamKind;

/// The position of a single parameter inside a stage's flat buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    offset: usize,
    len: usize,
}

impl Slot {
    /// Returns the amount of values this slot spans.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Gives the portion of a flat buffer that belongs to this slot.
    ///
    /// The buffer must come from the layout this slot was registered in.
    pub fn of<'a>(&self, buf: &'a [f32]) -> &'a [f32] {
        &buf[self.range()]
    }

    /// Gives the mutable portion of a flat buffer that belongs to this slot.
    pub fn of_mut<'a>(&self, buf: &'a mut [f32]) -> &'a mut [f32] {
        &mut buf[self.range()]
    }
}

/// A named parameter of a stage.
#[derive(Debug, Clone)]
pub struct ParamEntry {
    name: String,
    shape: Vec<usize>,
    slot: Slot,
    kind: ParamKind,
}

impl ParamEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.slot.len
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_empty()
    }
}

/// Collects the parameters declared by the layers of a stage while it is being built.
#[derive(Debug, Default)]
pub struct LayoutBuilder {
    entries: Vec<ParamEntry>,
    size: usize,
}

impl LayoutBuilder {
    /// Creates a new empty `LayoutBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new parameter right after the previously registered one.
    ///
    /// # Arguments
    /// * `name` - The unique name of the parameter.
    /// * `shape` - The shape the parameter is viewed with.
    /// * `kind` - The tag that decides how the parameter is initialized.
    ///
    /// # Returns
    /// The slot the owning layer uses to view the parameter and its gradient.
    pub fn register(&mut self, name: impl Into<String>, shape: &[usize], kind: ParamKind) -> Slot {
        let len = shape.iter().product();
        let slot = Slot {
            offset: self.size,
            len,
        };

        self.size += len;
        self.entries.push(ParamEntry {
            name: name.into(),
            shape: shape.to_vec(),
            slot,
            kind,
        });

        slot
    }

    /// Finishes the layout.
    pub fn finish(self) -> ParamLayout {
        let index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.name.clone(), i))
            .collect();

        ParamLayout {
            entries: self.entries,
            size: self.size,
            index,
        }
    }
}

/// The immutable mapping from parameter names to their slots in a stage's flat buffers.
#[derive(Debug, Clone)]
pub struct ParamLayout {
    entries: Vec<ParamEntry>,
    size: usize,
    index: HashMap<String, usize>,
}

impl ParamLayout {
    /// Returns the total amount of values of the stage.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the entries in registration order.
    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ParamEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_contiguous() {
        let mut builder = LayoutBuilder::new();
        let a = builder.register("a", &[2, 3], ParamKind::NormScale);
        let b = builder.register("b", &[4], ParamKind::NormShift);
        let layout = builder.finish();

        assert_eq!(a.range(), 0..6);
        assert_eq!(b.range(), 6..10);
        assert_eq!(layout.size(), 10);
        assert_eq!(layout.entry("b").unwrap().shape(), [4]);
        assert!(layout.entry("c").is_none());
    }

    #[test]
    fn slot_views_its_portion() {
        let mut builder = LayoutBuilder::new();
        builder.register("a", &[1], ParamKind::NormScale);
        let b = builder.register("b", &[2], ParamKind::NormShift);

        let buf = [1., 2., 3.];
        assert_eq!(b.of(&buf), [2., 3.]);
    }
}
