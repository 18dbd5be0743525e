use crate::mutation::descriptor::Patch;
use crate::query::entry::QueryEntry;

/// What applying a [`Patch`] did to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchEffect {
    /// The entry had no data, or the item was not in it.
    Untouched,
    Removed(usize),
    Merged,
    Inserted,
    Replaced,
}

impl Patch {
    /// Apply the optimistic change to `entry` in place.
    ///
    /// Only successful entries carry data, so anything else is left as is.
    /// `total` moves by the number of items actually added or removed and
    /// never drops below zero.
    pub fn apply(&self, entry: &mut QueryEntry) -> PatchEffect {
        if !entry.is_success() {
            return PatchEffect::Untouched;
        }
        let Some(data) = entry.data.as_mut() else {
            return PatchEffect::Untouched;
        };

        match self {
            Self::Remove { id } => {
                let before = data.len();
                data.retain(|item| &item.id != id);
                let removed = before - data.len();
                if removed == 0 {
                    return PatchEffect::Untouched;
                }
                entry.total = entry
                    .total
                    .map(|total| total.saturating_sub(removed as u64));
                PatchEffect::Removed(removed)
            }
            Self::Merge { id, fields } => match data.iter_mut().find(|item| &item.id == id) {
                Some(item) => {
                    item.apply_fields(fields);
                    PatchEffect::Merged
                }
                None => PatchEffect::Untouched,
            },
            Self::Prepend { item } => {
                if let Some(existing) = data.iter_mut().find(|existing| existing.id == item.id) {
                    existing.clone_from(item);
                    return PatchEffect::Replaced;
                }
                data.insert(0, item.clone());
                entry.total = entry.total.map(|total| total + 1);
                PatchEffect::Inserted
            }
        }
    }
}
