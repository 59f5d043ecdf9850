//! Slot number to VM id bindings.

use std::collections::HashMap;

/// In-memory table of which VM occupies which slot.
///
/// Slot numbers are opaque to the table: any `i32` is a valid slot and
/// there is no capacity limit.
#[derive(Debug, Default, Clone)]
pub struct SlotTable {
    slots: HashMap<i32, String>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The VM id bound to `slot`, if any.
    pub fn lookup(&self, slot: i32) -> Option<&str> {
        self.slots.get(&slot).map(String::as_str)
    }

    /// Bind `slot` to `id`, returning the id it replaced.
    pub fn bind(&mut self, slot: i32, id: impl Into<String>) -> Option<String> {
        self.slots.insert(slot, id.into())
    }

    /// Clear every slot occupied by `id` and return the cleared slot numbers.
    pub fn unbind_by_occupant(&mut self, id: &str) -> Vec<i32> {
        let mut cleared = Vec::new();
        self.slots.retain(|slot, occupant| {
            if occupant == id {
                cleared.push(*slot);
                false
            } else {
                true
            }
        });
        cleared.sort_unstable();
        cleared
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
