use std::collections::HashMap;
use std::path::Path;

use crate::catalog::Document;
use crate::model::{Record, RecordId};

/// Classification of one directory's candidates against the rows under the same parent.
///
/// Existing rows without a candidate appear in none of the sets. They keep whatever
/// scan flag they carry and are left for the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merge<T> {
    pub insert: Vec<T>,
    pub remain: Vec<Record<T>>,
    /// Existing rows with the candidate's document already swapped in.
    pub update: Vec<Record<T>>,
}

impl<T> Merge<T> {
    pub fn confirmed_ids(&self) -> Vec<RecordId> {
        self.remain
            .iter()
            .chain(self.update.iter())
            .map(|record| record.id)
            .collect()
    }

    pub fn report(&self) -> MergeReport {
        MergeReport {
            inserted: self.insert.len(),
            remained: self.remain.len(),
            updated: self.update.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub remained: usize,
    pub updated: usize,
}

impl std::ops::AddAssign for MergeReport {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.remained += rhs.remained;
        self.updated += rhs.updated;
    }
}

pub fn merge<T: Document>(existing: &[Record<T>], candidates: Vec<T>) -> Merge<T> {
    let by_path: HashMap<&Path, &Record<T>> = existing
        .iter()
        .map(|record| (record.doc.path(), record))
        .collect();

    let mut outcome = Merge {
        insert: Vec::new(),
        remain: Vec::new(),
        update: Vec::new(),
    };

    for candidate in candidates {
        match by_path.get(candidate.path()) {
            None => outcome.insert.push(candidate),
            Some(current) if current.doc.same_physical(&candidate) => {
                outcome.remain.push((*current).clone())
            }
            Some(current) => outcome.update.push(Record {
                id: current.id,
                flags: current.flags.clone(),
                doc: candidate,
            }),
        }
    }

    outcome
}
