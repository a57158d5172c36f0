//! Indirect reference table.
//!
//! Native code never sees object addresses. It gets a [`Handle`] that names a
//! slot in one of these tables, and the collector is free to clear or move the
//! slot's target while the owning thread is not Runnable.
//!
//! Local references are added and removed in stack order most of the time, so
//! the table is a plain array with a top index. Out-of-order removal leaves a
//! hole that the next add in the same segment fills. A segment is the range of
//! slots owned by one local frame; popping the frame resets the top index to the
//! frame's bottom, releasing everything above it at once.
use std::fmt;

use parking_lot::RwLock;

use crate::{
    error::{fatal, Error, Result},
    reference::{Handle, ObjectRef, RefKind, ReferenceTable, Resolved, SERIAL_MASK},
};

/// Hard upper bound on entries in a single table.
pub const MAX_TABLE_ENTRIES: usize = 1 << 24;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SegmentState {
    pub top_index: u32,
}

pub const FIRST_SEGMENT: SegmentState = SegmentState { top_index: 0 };

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Entry {
    Empty,
    Live(ObjectRef),
    /// Weak global whose target the collector found unreachable.
    Cleared,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    serial: u32,
    entry: Entry,
}

impl Slot {
    const EMPTY: Self = Self {
        serial: 0,
        entry: Entry::Empty,
    };

    fn add(&mut self, obj: ObjectRef) {
        self.serial = self.serial.wrapping_add(1);
        self.entry = Entry::Live(obj);
    }

    fn short_serial(&self) -> u8 {
        (self.serial as usize & SERIAL_MASK) as u8
    }

    fn is_empty(&self) -> bool {
        self.entry == Entry::Empty
    }
}

pub struct IndirectReferenceTable {
    kind: RefKind,
    /// Slots up to the high-water mark. Slots above the top index keep their
    /// serial so that handles into a popped segment stay detectably stale.
    table: Vec<Slot>,
    segment_state: SegmentState,
    last_known_previous_state: SegmentState,
    current_num_holes: usize,
    max_entries: usize,
    resizable: bool,
}

impl IndirectReferenceTable {
    pub fn new(kind: RefKind, max_entries: usize, resizable: bool) -> Self {
        let max_entries = max_entries.clamp(1, MAX_TABLE_ENTRIES);
        Self {
            kind,
            table: Vec::with_capacity(max_entries.min(1024)),
            segment_state: FIRST_SEGMENT,
            last_known_previous_state: FIRST_SEGMENT,
            current_num_holes: 0,
            max_entries,
            resizable,
        }
    }

    pub fn kind(&self) -> RefKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Number of occupied slots, holes excluded.
    pub fn len(&self) -> usize {
        self.table[..self.top_index()]
            .iter()
            .filter(|slot| !slot.is_empty())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_state(&self) -> SegmentState {
        self.segment_state
    }

    pub fn set_segment_state(&mut self, new_state: SegmentState) {
        log::trace!(target: "jni", "{} table segment {} -> {}", self.kind, self.segment_state.top_index, new_state.top_index);
        self.segment_state = new_state;
    }

    #[inline]
    fn top_index(&self) -> usize {
        self.segment_state.top_index as usize
    }

    fn count_empty(&self, from: usize, to: usize) -> usize {
        self.table[from..to].iter().filter(|slot| slot.is_empty()).count()
    }

    /// The hole count is only valid for the segment it was computed for. Any
    /// push or pop of a segment since then is detected by comparing the last
    /// known bottom index against the current segment bounds.
    fn recover_holes(&mut self, previous_state: SegmentState) {
        if self.last_known_previous_state.top_index >= self.segment_state.top_index
            || self.last_known_previous_state.top_index < previous_state.top_index
        {
            let count = self.count_empty(previous_state.top_index as usize, self.top_index());
            self.current_num_holes = count;
            self.last_known_previous_state = previous_state;
        }
    }

    pub fn add(&mut self, previous_state: SegmentState, obj: ObjectRef) -> Result<Handle> {
        let mut top_index = self.top_index();

        if top_index == self.max_entries {
            if !self.resizable || self.max_entries >= MAX_TABLE_ENTRIES {
                log::error!(target: "jni", "JNI ERROR (app bug): {}", self);
                return Err(Error::TableOverflow {
                    kind: self.kind,
                    max: self.max_entries,
                });
            }

            self.max_entries = (self.max_entries * 2).min(MAX_TABLE_ENTRIES);
            log::debug!(target: "jni", "{} table resized to {} entries", self.kind, self.max_entries);
        }

        self.recover_holes(previous_state);

        let bottom_index = previous_state.top_index as usize;
        let hole = if self.current_num_holes > 0 {
            (bottom_index..top_index)
                .rev()
                .find(|&index| self.table[index].is_empty())
        } else {
            None
        };

        let index = match hole {
            Some(index) => {
                self.current_num_holes -= 1;
                index
            }
            None => {
                self.current_num_holes = 0;
                top_index += 1;
                self.segment_state.top_index = top_index as u32;
                top_index - 1
            }
        };

        if index == self.table.len() {
            self.table.push(Slot::EMPTY);
        }

        let slot = &mut self.table[index];
        slot.add(obj);
        Ok(Handle::new(self.kind, slot.short_serial(), index as u32))
    }

    /// Removes `handle` from the current segment. Handles outside the segment,
    /// stale handles and handles of another kind are left alone and reported
    /// as not removed.
    pub fn remove(&mut self, previous_state: SegmentState, handle: Handle) -> bool {
        if handle.kind() != self.kind {
            log::warn!(target: "jni", "Attempt to remove {} reference {} from {} table", handle.kind(), handle, self.kind);
            return false;
        }

        let top_index = self.top_index();
        let bottom_index = previous_state.top_index as usize;
        let index = handle.index() as usize;

        if index < bottom_index {
            log::warn!(target: "jni", "Attempt to remove index outside index area ({} vs {}-{})", index, bottom_index, top_index);
            return false;
        }

        if index >= top_index {
            log::warn!(target: "jni", "Attempt to remove invalid index {} (bottom={} top={})", index, bottom_index, top_index);
            return false;
        }

        self.recover_holes(previous_state);

        if self.table[index].is_empty() {
            log::info!(target: "jni", "--- WEIRD: removing null entry {}", index);
            return false;
        }

        if self.table[index].short_serial() != handle.serial() {
            log::warn!(target: "jni", "Attempt to remove stale {} reference {}", self.kind, handle);
            return false;
        }

        self.table[index].entry = Entry::Empty;

        if index == top_index - 1 {
            let mut collapse_top_index = top_index;
            loop {
                collapse_top_index -= 1;
                if collapse_top_index <= bottom_index || self.current_num_holes == 0 {
                    break;
                }

                if !self.table[collapse_top_index - 1].is_empty() {
                    break;
                }

                self.current_num_holes -= 1;
            }

            self.segment_state.top_index = collapse_top_index as u32;
        } else {
            self.current_num_holes += 1;
        }

        true
    }

    fn slot(&self, handle: Handle) -> Result<&Slot> {
        let raw = handle.into_raw();

        if handle.kind() != self.kind {
            return Err(Error::InvalidReference {
                raw,
                reason: "reference kind does not match its table",
            });
        }

        let index = handle.index() as usize;
        if index >= self.top_index() {
            return Err(Error::InvalidReference {
                raw,
                reason: "index past the top of the table",
            });
        }

        let slot = &self.table[index];
        if slot.short_serial() != handle.serial() {
            return Err(Error::InvalidReference {
                raw,
                reason: "stale reference, slot was reused",
            });
        }

        if slot.is_empty() {
            return Err(Error::InvalidReference {
                raw,
                reason: "reference was deleted",
            });
        }

        Ok(slot)
    }

    /// Returns the target of `handle`, or `None` if it is a cleared weak global.
    pub fn get(&self, handle: Handle) -> Result<Option<ObjectRef>> {
        Ok(match self.slot(handle)?.entry {
            Entry::Live(obj) => Some(obj),
            _ => None,
        })
    }

    /// Clears one weak global as the collector would when its target dies.
    pub fn clear_weak(&mut self, handle: Handle) -> Result<()> {
        self.slot(handle)?;
        if self.kind != RefKind::WeakGlobal {
            return Err(Error::InvalidReference {
                raw: handle.into_raw(),
                reason: "only weak globals can be cleared",
            });
        }

        self.table[handle.index() as usize].entry = Entry::Cleared;
        Ok(())
    }

    /// Processes weak entries after marking. `update` returns the (possibly
    /// relocated) target for live objects and `None` for dead ones. Returns the
    /// number of entries cleared by this sweep.
    pub fn sweep(&mut self, mut update: impl FnMut(ObjectRef) -> Option<ObjectRef>) -> usize {
        if self.kind != RefKind::WeakGlobal {
            fatal(format_args!("{} table swept as weak", self.kind));
        }

        let top_index = self.top_index();
        let mut cleared = 0;
        for slot in self.table[..top_index].iter_mut() {
            if let Entry::Live(obj) = slot.entry {
                slot.entry = match update(obj) {
                    Some(obj) => Entry::Live(obj),
                    None => {
                        cleared += 1;
                        Entry::Cleared
                    }
                };
            }
        }

        cleared
    }

    /// Visits every live target as a root, storing back the value `visit`
    /// returns so a moving collector can relocate it.
    pub fn visit_roots(&mut self, mut visit: impl FnMut(ObjectRef) -> ObjectRef) {
        let top_index = self.top_index();
        for slot in self.table[..top_index].iter_mut() {
            if let Entry::Live(obj) = slot.entry {
                slot.entry = Entry::Live(visit(obj));
            }
        }
    }
}

impl fmt::Display for IndirectReferenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let top_index = self.top_index();
        let cleared = self.table[..top_index]
            .iter()
            .filter(|slot| slot.entry == Entry::Cleared)
            .count();
        write!(
            f,
            "{} table: {} in use, {} cleared, {} holes, top {} (max={})",
            self.kind,
            self.len(),
            cleared,
            self.count_empty(0, top_index),
            top_index,
            self.max_entries
        )
    }
}

impl ReferenceTable for IndirectReferenceTable {
    fn resolve(&self, handle: Handle) -> Result<Resolved> {
        let slot = self.slot(handle)?;
        Ok(Resolved {
            kind: self.kind,
            cleared: slot.entry == Entry::Cleared,
            target: match slot.entry {
                Entry::Live(obj) => Some(obj),
                _ => None,
            },
        })
    }
}

impl ReferenceTable for RwLock<IndirectReferenceTable> {
    fn resolve(&self, handle: Handle) -> Result<Resolved> {
        self.read().resolve(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).unwrap()
    }

    #[test]
    fn add_and_get() {
        let mut irt = IndirectReferenceTable::new(RefKind::Global, 16, false);
        let a = irt.add(FIRST_SEGMENT, obj(0x1000)).unwrap();
        let b = irt.add(FIRST_SEGMENT, obj(0x2000)).unwrap();

        assert_eq!(a.kind(), RefKind::Global);
        assert_eq!(irt.get(a), Ok(Some(obj(0x1000))));
        assert_eq!(irt.get(b), Ok(Some(obj(0x2000))));
        assert_eq!(irt.len(), 2);
    }

    #[test]
    fn holes_are_reused_and_collapsed() {
        let mut irt = IndirectReferenceTable::new(RefKind::Local, 16, false);
        let a = irt.add(FIRST_SEGMENT, obj(0x10)).unwrap();
        let b = irt.add(FIRST_SEGMENT, obj(0x20)).unwrap();
        let c = irt.add(FIRST_SEGMENT, obj(0x30)).unwrap();

        assert!(irt.remove(FIRST_SEGMENT, b));
        assert_eq!(irt.segment_state().top_index, 3);

        let d = irt.add(FIRST_SEGMENT, obj(0x40)).unwrap();
        assert_eq!(d.index(), b.index());
        assert_eq!(irt.segment_state().top_index, 3);

        assert!(irt.remove(FIRST_SEGMENT, d));
        assert!(irt.remove(FIRST_SEGMENT, c));
        // removing the top entry eats the hole below it
        assert_eq!(irt.segment_state().top_index, 1);
        assert_eq!(irt.get(a), Ok(Some(obj(0x10))));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let mut irt = IndirectReferenceTable::new(RefKind::Local, 16, false);
        let a = irt.add(FIRST_SEGMENT, obj(0x10)).unwrap();
        assert!(irt.remove(FIRST_SEGMENT, a));
        let b = irt.add(FIRST_SEGMENT, obj(0x20)).unwrap();

        assert_eq!(a.index(), b.index());
        assert_ne!(a.serial(), b.serial());
        assert!(matches!(irt.get(a), Err(Error::InvalidReference { .. })));
        assert!(!irt.remove(FIRST_SEGMENT, a));
        assert_eq!(irt.get(b), Ok(Some(obj(0x20))));
    }

    #[test]
    fn overflow_when_not_resizable() {
        let mut irt = IndirectReferenceTable::new(RefKind::Global, 2, false);
        irt.add(FIRST_SEGMENT, obj(0x10)).unwrap();
        irt.add(FIRST_SEGMENT, obj(0x20)).unwrap();

        assert_eq!(
            irt.add(FIRST_SEGMENT, obj(0x30)),
            Err(Error::TableOverflow {
                kind: RefKind::Global,
                max: 2
            })
        );
    }

    #[test]
    fn resizable_table_doubles() {
        let mut irt = IndirectReferenceTable::new(RefKind::Local, 2, true);
        for i in 1..=5 {
            irt.add(FIRST_SEGMENT, obj(i * 0x10)).unwrap();
        }

        assert_eq!(irt.capacity(), 8);
        assert_eq!(irt.len(), 5);
    }

    #[test]
    fn popping_a_segment_releases_its_entries() {
        let mut irt = IndirectReferenceTable::new(RefKind::Local, 16, false);
        let outer = irt.add(FIRST_SEGMENT, obj(0x10)).unwrap();

        let cookie = irt.segment_state();
        let inner = irt.add(cookie, obj(0x20)).unwrap();
        assert!(!irt.remove(cookie, outer), "outer entry belongs to the previous segment");

        irt.set_segment_state(cookie);
        assert!(matches!(irt.get(inner), Err(Error::InvalidReference { .. })));
        assert_eq!(irt.get(outer), Ok(Some(obj(0x10))));
    }

    #[test]
    fn sweep_clears_dead_and_relocates_live() {
        let mut irt = IndirectReferenceTable::new(RefKind::WeakGlobal, 16, false);
        let dead = irt.add(FIRST_SEGMENT, obj(0x10)).unwrap();
        let live = irt.add(FIRST_SEGMENT, obj(0x20)).unwrap();

        let cleared = irt.sweep(|target| {
            if target == obj(0x10) {
                None
            } else {
                Some(obj(target.addr() + 0x1000))
            }
        });

        assert_eq!(cleared, 1);
        assert_eq!(irt.get(dead), Ok(None));
        assert_eq!(
            irt.resolve(dead).unwrap(),
            Resolved {
                kind: RefKind::WeakGlobal,
                cleared: true,
                target: None
            }
        );
        assert_eq!(irt.get(live), Ok(Some(obj(0x1020))));

        // a cleared weak global can still be deleted
        assert!(irt.remove(FIRST_SEGMENT, dead));
    }

    #[test]
    fn visit_roots_updates_targets() {
        let mut irt = IndirectReferenceTable::new(RefKind::Global, 16, false);
        let a = irt.add(FIRST_SEGMENT, obj(0x10)).unwrap();
        irt.visit_roots(|target| obj(target.addr() * 2));
        assert_eq!(irt.get(a), Ok(Some(obj(0x20))));
    }

    #[test]
    fn wrong_table_is_rejected() {
        let mut irt = IndirectReferenceTable::new(RefKind::Global, 16, false);
        irt.add(FIRST_SEGMENT, obj(0x10)).unwrap();
        let foreign = Handle::new(RefKind::Local, 1, 0);
        assert!(matches!(irt.resolve(foreign), Err(Error::InvalidReference { .. })));
        assert!(!irt.remove(FIRST_SEGMENT, foreign));
    }
}
