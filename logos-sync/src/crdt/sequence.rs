//! Replicated growable array (RGA) for a single text field.
//!
//! ```text
//!   Head ─► [H 1@a] [i 2@a] [x 3@b†] [! 4@a]        († = tombstone)
//!                     ▲
//!   insert 5@b after 2@a: skip every following element with a larger
//!   OpId, stop at the first smaller one.
//! ```
//!
//! Deleted elements stay in place as tombstones so later inserts can still
//! anchor on them. Operations whose anchor or target has not arrived yet are
//! parked and released when it does, which makes the final order independent
//! of delivery order.

use std::collections::{HashMap, HashSet};

use super::op::{Anchor, OpId};

#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    ch: char,
    deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Sequence {
    elements: Vec<Element>,
    integrated: HashSet<OpId>,
    /// Inserts waiting for their anchor, keyed by the missing anchor.
    waiting_inserts: HashMap<OpId, Vec<(OpId, char)>>,
    /// Delete targets seen before the element itself.
    waiting_deletes: HashSet<OpId>,
    visible: usize,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Whether the element created by `id` has been integrated.
    pub fn contains(&self, id: &OpId) -> bool {
        self.integrated.contains(id)
    }

    /// Operations parked until a missing reference arrives.
    pub fn pending(&self) -> usize {
        self.waiting_inserts.values().map(Vec::len).sum::<usize>() + self.waiting_deletes.len()
    }

    /// Total elements including tombstones.
    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.ch)
            .collect()
    }

    /// Id of the `index`-th visible character.
    pub fn visible_id(&self, index: usize) -> Option<OpId> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .nth(index)
            .map(|e| e.id)
    }

    /// Ids of `len` visible characters starting at `start`.
    pub fn visible_range(&self, start: usize, len: usize) -> Vec<OpId> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .skip(start)
            .take(len)
            .map(|e| e.id)
            .collect()
    }

    /// Anchor for typing at visible position `index`.
    pub fn anchor_at(&self, index: usize) -> Anchor {
        match index.checked_sub(1).and_then(|i| self.visible_id(i)) {
            Some(id) => Anchor::After(id),
            None => Anchor::Head,
        }
    }

    /// Integrate an insert. Returns true if the visible text changed.
    pub fn insert(&mut self, id: OpId, after: Anchor, ch: char) -> bool {
        if self.integrated.contains(&id) {
            return false;
        }
        if let Anchor::After(anchor) = after {
            if !self.integrated.contains(&anchor) {
                self.waiting_inserts.entry(anchor).or_default().push((id, ch));
                return false;
            }
        }

        let mut changed = false;
        let mut ready = vec![(id, after, ch)];
        while let Some((id, after, ch)) = ready.pop() {
            changed |= self.place(id, after, ch);
            if let Some(children) = self.waiting_inserts.remove(&id) {
                ready.extend(
                    children
                        .into_iter()
                        .map(|(child, ch)| (child, Anchor::After(id), ch)),
                );
            }
        }
        changed
    }

    /// Tombstone the element created by `target`. Returns true if the
    /// visible text changed.
    pub fn delete(&mut self, target: OpId) -> bool {
        match self.position(&target) {
            Some(index) => {
                let element = &mut self.elements[index];
                if element.deleted {
                    return false;
                }
                element.deleted = true;
                self.visible -= 1;
                true
            }
            None => {
                self.waiting_deletes.insert(target);
                false
            }
        }
    }

    fn position(&self, id: &OpId) -> Option<usize> {
        if !self.integrated.contains(id) {
            return None;
        }
        self.elements.iter().position(|e| e.id == *id)
    }

    /// Caller guarantees the anchor is integrated.
    fn place(&mut self, id: OpId, after: Anchor, ch: char) -> bool {
        let mut index = match after {
            Anchor::Head => 0,
            Anchor::After(anchor) => match self.position(&anchor) {
                Some(p) => p + 1,
                None => return false,
            },
        };
        while index < self.elements.len() && self.elements[index].id > id {
            index += 1;
        }

        let deleted = self.waiting_deletes.remove(&id);
        self.elements.insert(index, Element { id, ch, deleted });
        self.integrated.insert(id);
        if !deleted {
            self.visible += 1;
        }
        !deleted
    }
}
