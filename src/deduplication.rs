// 🔍 Deduplication - first occurrence of a natural key wins
//
// The source file is append-only per reporting period, so the first row
// carrying a key is authoritative for that file. Later rows with the same
// key are dropped from that level only; other levels still see them.

use crate::normalize::NormalizedRow;
use std::collections::HashSet;
use std::hash::Hash;

/// Items kept per key, in input order
#[derive(Debug, Clone)]
pub struct Deduplicated<'a, T> {
    pub kept: Vec<&'a T>,
    pub discarded: usize,
}

pub fn first_seen<'a, T, K, I, F>(items: I, key: F) -> Deduplicated<'a, T>
where
    I: IntoIterator<Item = &'a T>,
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut discarded = 0;

    for item in items {
        if seen.insert(key(item)) {
            kept.push(item);
        } else {
            discarded += 1;
        }
    }

    Deduplicated { kept, discarded }
}

/// Counterparty level: (tax id, address)
pub fn counterparty_rows<'a, I>(rows: I) -> Deduplicated<'a, NormalizedRow>
where
    I: IntoIterator<Item = &'a NormalizedRow>,
{
    first_seen(rows, |row| (row.tax_id.clone(), row.address.clone()))
}

/// Contract level: contract number. Rows without one take no part.
pub fn contract_rows<'a, I>(rows: I) -> Deduplicated<'a, NormalizedRow>
where
    I: IntoIterator<Item = &'a NormalizedRow>,
{
    first_seen(
        rows.into_iter().filter(|row| !row.contract_number.is_empty()),
        |row| row.contract_number.clone(),
    )
}
