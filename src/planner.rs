// 🧮 Diff/Upsert Planner - decide create / update / no-op per candidate
//
// Existing rows are bulk-loaded by the caller; the planner only matches them
// to candidates by natural key and computes the minimal changed field set.

use crate::error::EntityLevel;
use rusqlite::types::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

/// Sorted names of the columns an update touches
pub type FieldSet = Vec<&'static str>;

/// A candidate entity that can be matched against persisted state
pub trait Reconcile {
    type Key: Eq + Hash + Clone + Debug;
    type Existing;

    const TABLE: &'static str;
    const LEVEL: EntityLevel;
    /// Columns written on create (id and timestamps are added by the writer)
    const COLUMNS: &'static [&'static str];

    fn key(&self) -> Self::Key;
    fn existing_key(existing: &Self::Existing) -> Self::Key;
    fn existing_id(existing: &Self::Existing) -> &str;

    /// Names of the fields whose desired value differs from the stored one
    fn changed_fields(&self, existing: &Self::Existing) -> FieldSet;

    /// SQL value of one column as this candidate wants it
    fn value(&self, field: &str) -> Value;

    /// Human-readable natural key for failure reports
    fn key_label(&self) -> String;
}

/// Push `name` when the two values differ
pub fn diff_field<T: PartialEq + ?Sized>(fields: &mut FieldSet, name: &'static str, desired: &T, current: &T) {
    if desired != current {
        fields.push(name);
    }
}

#[derive(Debug)]
pub struct Matched<'a, C> {
    pub id: String,
    pub candidate: &'a C,
}

#[derive(Debug)]
pub struct UpsertPlan<'a, C: Reconcile> {
    pub creates: Vec<&'a C>,
    /// Homogeneous groups: every update in a group sets the same columns
    pub updates: BTreeMap<FieldSet, Vec<Matched<'a, C>>>,
    pub unchanged: Vec<Matched<'a, C>>,
}

impl<'a, C: Reconcile> UpsertPlan<'a, C> {
    pub fn build<I>(candidates: I, existing: Vec<C::Existing>) -> Self
    where
        I: IntoIterator<Item = &'a C>,
    {
        let mut by_key: HashMap<C::Key, C::Existing> = HashMap::new();
        for row in existing {
            by_key.entry(C::existing_key(&row)).or_insert(row);
        }

        let mut plan = UpsertPlan {
            creates: Vec::new(),
            updates: BTreeMap::new(),
            unchanged: Vec::new(),
        };

        for candidate in candidates {
            let Some(current) = by_key.get(&candidate.key()) else {
                plan.creates.push(candidate);
                continue;
            };

            let matched = Matched {
                id: C::existing_id(current).to_string(),
                candidate,
            };
            let mut fields = candidate.changed_fields(current);
            if fields.is_empty() {
                plan.unchanged.push(matched);
            } else {
                fields.sort_unstable();
                plan.updates.entry(fields).or_default().push(matched);
            }
        }

        plan
    }

    pub fn update_count(&self) -> usize {
        self.updates.values().map(Vec::len).sum()
    }

    /// Keys of candidates that already exist, mapped to their stored id
    pub fn existing_ids(&self) -> HashMap<C::Key, String> {
        self.updates
            .values()
            .flatten()
            .chain(self.unchanged.iter())
            .map(|m| (m.candidate.key(), m.id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Item {
        key: &'static str,
        colour: &'static str,
        size: i64,
    }

    struct Stored {
        id: &'static str,
        key: &'static str,
        colour: &'static str,
        size: i64,
    }

    impl Reconcile for Item {
        type Key = &'static str;
        type Existing = Stored;

        const TABLE: &'static str = "items";
        const LEVEL: EntityLevel = EntityLevel::Counterparty;
        const COLUMNS: &'static [&'static str] = &["key", "colour", "size"];

        fn key(&self) -> Self::Key {
            self.key
        }

        fn existing_key(existing: &Stored) -> Self::Key {
            existing.key
        }

        fn existing_id(existing: &Stored) -> &str {
            existing.id
        }

        fn changed_fields(&self, existing: &Stored) -> FieldSet {
            let mut fields = Vec::new();
            diff_field(&mut fields, "size", &self.size, &existing.size);
            diff_field(&mut fields, "colour", self.colour, existing.colour);
            fields
        }

        fn value(&self, field: &str) -> Value {
            match field {
                "key" => Value::Text(self.key.to_string()),
                "colour" => Value::Text(self.colour.to_string()),
                "size" => Value::Integer(self.size),
                _ => Value::Null,
            }
        }

        fn key_label(&self) -> String {
            self.key.to_string()
        }
    }

    fn item(key: &'static str, colour: &'static str, size: i64) -> Item {
        Item { key, colour, size }
    }

    fn stored(id: &'static str, key: &'static str, colour: &'static str, size: i64) -> Stored {
        Stored { id, key, colour, size }
    }

    #[test]
    fn test_partition_into_create_update_unchanged() {
        let candidates = vec![
            item("a", "red", 1),
            item("b", "blue", 2),
            item("c", "green", 3),
        ];
        let existing = vec![stored("id-b", "b", "blue", 2), stored("id-c", "c", "green", 4)];

        let plan = UpsertPlan::build(&candidates, existing);

        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].key, "a");
        assert_eq!(plan.unchanged.len(), 1);
        assert_eq!(plan.unchanged[0].id, "id-b");
        assert_eq!(plan.update_count(), 1);
        assert_eq!(plan.updates.get(&vec!["size"]).unwrap()[0].id, "id-c");
    }

    #[test]
    fn test_updates_grouped_by_exact_field_set() {
        let candidates = vec![
            item("a", "red", 10),
            item("b", "red", 2),
            item("c", "red", 30),
            item("d", "blue", 40),
        ];
        let existing = vec![
            stored("1", "a", "blue", 1),
            stored("2", "b", "blue", 2),
            stored("3", "c", "blue", 3),
            stored("4", "d", "blue", 4),
        ];

        let plan = UpsertPlan::build(&candidates, existing);

        let groups: Vec<(&FieldSet, usize)> =
            plan.updates.iter().map(|(f, rows)| (f, rows.len())).collect();
        assert_eq!(
            groups,
            vec![(&vec!["colour"], 1), (&vec!["colour", "size"], 2), (&vec!["size"], 1)]
        );
    }

    #[test]
    fn test_first_existing_row_wins_on_duplicate_keys() {
        let candidates = vec![item("a", "red", 1)];
        let existing = vec![stored("first", "a", "red", 1), stored("second", "a", "blue", 9)];

        let plan = UpsertPlan::build(&candidates, existing);

        assert_eq!(plan.unchanged[0].id, "first");
        assert_eq!(plan.existing_ids().get("a"), Some(&"first".to_string()));
    }
}
