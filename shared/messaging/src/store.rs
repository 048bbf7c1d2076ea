//! Ordered per-conversation message container.

use crate::message::{Message, Receivable};
use crate::reaction::Reaction;
use indexmap::IndexMap;

/// Identifier-keyed map kept in ascending (date, rowid) order.
///
/// Lookup by identifier is O(1) on average. New entries are placed by scanning
/// backward from the newest one, which is cheap because rows mostly arrive in
/// chronological order.
#[derive(Debug, Clone)]
pub struct OrderedMessageStore<T: Receivable = Message> {
    entries: IndexMap<i64, T>,
    most_recent: Option<i64>,
}

impl<T: Receivable> OrderedMessageStore<T> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            most_recent: None,
        }
    }

    /// Insert a new entity in order, or merge it into the stored copy.
    pub fn insert(&mut self, entity: T) {
        let rowid = entity.rowid();
        if let Some(existing) = self.entries.get_mut(&rowid) {
            existing.merge(&entity);
            return;
        }

        let mut position = self.entries.len();
        while position > 0 {
            match self.entries.get_index(position - 1) {
                Some((_, current)) if !entity.is_newer(current) => position -= 1,
                _ => break,
            }
        }

        let newest = self
            .most_recent()
            .map_or(true, |current| entity.is_newer(current));
        self.entries.shift_insert(position, rowid, entity);
        if newest {
            self.most_recent = Some(rowid);
        }
    }

    pub fn remove(&mut self, rowid: i64) -> Option<T> {
        let removed = self.entries.shift_remove(&rowid)?;
        if self.most_recent == Some(rowid) {
            self.most_recent = self.entries.last().map(|(id, _)| *id);
        }
        Some(removed)
    }

    pub fn most_recent(&self) -> Option<&T> {
        self.most_recent.and_then(|rowid| self.entries.get(&rowid))
    }

    pub fn get(&self, rowid: i64) -> Option<&T> {
        self.entries.get(&rowid)
    }

    /// Mutable access for fields that do not affect ordering.
    pub(crate) fn get_mut(&mut self, rowid: i64) -> Option<&mut T> {
        self.entries.get_mut(&rowid)
    }

    pub fn contains(&self, rowid: i64) -> bool {
        self.entries.contains_key(&rowid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl OrderedMessageStore<Message> {
    /// Apply a reaction to its target message. Unknown targets are dropped.
    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        match self.entries.get_mut(&reaction.target_message_id()) {
            Some(message) => message.add_reaction(reaction),
            None => false,
        }
    }
}

impl<T: Receivable> Default for OrderedMessageStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reaction::{ReactionKind, ReactionType};

    fn store_of(rows: &[(i64, i64)]) -> OrderedMessageStore {
        let mut store = OrderedMessageStore::new();
        for &(rowid, date) in rows {
            store.insert(Message::new(rowid, date));
        }
        store
    }

    fn keys(store: &OrderedMessageStore) -> Vec<(i64, i64)> {
        store.iter().map(|m| (m.date(), m.rowid())).collect()
    }

    #[test]
    fn older_message_is_spliced_before_newer() {
        let store = store_of(&[(1, 10), (2, 5)]);
        assert_eq!(store.ids().collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn equal_dates_are_ordered_by_rowid() {
        let store = store_of(&[(5, 1), (3, 1), (4, 1)]);
        assert_eq!(store.ids().collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn order_holds_for_every_insertion_permutation() {
        let rows = [(1, 30), (2, 10), (3, 20), (4, 10), (5, 40)];
        let mut expected = rows.iter().map(|&(id, date)| (date, id)).collect::<Vec<_>>();
        expected.sort();

        // Heap's algorithm over the five rows.
        let mut order = rows.to_vec();
        let mut counters = [0usize; 5];
        let mut permutations = vec![order.clone()];
        let mut i = 0;
        while i < order.len() {
            if counters[i] < i {
                let swap_with = if i % 2 == 0 { 0 } else { counters[i] };
                order.swap(swap_with, i);
                permutations.push(order.clone());
                counters[i] += 1;
                i = 0;
            } else {
                counters[i] = 0;
                i += 1;
            }
        }
        assert_eq!(permutations.len(), 120);

        for permutation in permutations {
            let mut store = OrderedMessageStore::new();
            let mut newest: Option<(i64, i64)> = None;
            for (rowid, date) in permutation {
                store.insert(Message::new(rowid, date));
                newest = newest.max(Some((date, rowid)));
                let recent = store.most_recent().map(|m| (m.date(), m.rowid()));
                assert_eq!(recent, newest);
            }
            assert_eq!(keys(&store), expected);
        }
    }

    #[test]
    fn reinserting_an_id_merges_without_moving() {
        let mut store = store_of(&[(1, 10), (2, 20), (3, 30)]);
        let mut update = Message::new(2, 99);
        update.is_read = true;
        update.date_read = 25;
        store.insert(update);

        assert_eq!(store.len(), 3);
        assert_eq!(store.ids().collect::<Vec<_>>(), vec![1, 2, 3]);
        let merged = store.get(2).unwrap();
        assert!(merged.is_read);
        assert_eq!(merged.date(), 20);
        assert_eq!(store.most_recent().map(|m| m.rowid()), Some(3));
    }

    #[test]
    fn empty_store_has_no_most_recent() {
        let store: OrderedMessageStore = OrderedMessageStore::new();
        assert!(store.most_recent().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn removing_the_newest_moves_most_recent_back() {
        let mut store = store_of(&[(1, 10), (-1, 50), (2, 20)]);
        assert_eq!(store.most_recent().map(|m| m.rowid()), Some(-1));
        assert!(store.remove(-1).is_some());
        assert_eq!(store.most_recent().map(|m| m.rowid()), Some(2));
        assert!(store.remove(-1).is_none());
    }

    #[test]
    fn reaction_without_target_is_dropped() {
        let mut store = store_of(&[(1, 10)]);
        let orphan = Reaction::new(2, 42, ReactionType::addition(ReactionKind::Like), 11);
        assert!(!store.add_reaction(orphan));
        let attached = Reaction::new(3, 1, ReactionType::addition(ReactionKind::Like), 12);
        assert!(store.add_reaction(attached));
        assert_eq!(store.get(1).unwrap().active_reactions().count(), 1);
    }
}
