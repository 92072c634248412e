//! Minimal-write reindexing for ordered lists.
//!
//! A drag-and-drop reorder usually reassigns dense positions `0..N` to every
//! visible item. Most of those assignments are no-ops; [`diff`] keeps only
//! the updates that change an item's position or group, so write volume
//! tracks the actual displacement rather than the list length.

use crate::error::{Error, Result};
use crate::models::{GroupChange, OrderUpdate, OrderedItem};
use std::collections::HashMap;

/// Filter `proposed` down to the updates that must be persisted.
///
/// - Unknown ids are always kept.
/// - Known ids are kept when `sort_order` differs, or when a group is
///   provided and differs from the current one. [`GroupChange::Keep`] never
///   counts as a change.
///
/// Output preserves the order of `proposed`.
#[must_use]
pub fn diff(current: &[OrderedItem], proposed: &[OrderUpdate]) -> Vec<OrderUpdate> {
    let by_id: HashMap<&str, &OrderedItem> =
        current.iter().map(|item| (item.id.as_str(), item)).collect();

    proposed
        .iter()
        .filter(|update| {
            by_id
                .get(update.item_id.as_str())
                .is_none_or(|item| is_real_change(item, update))
        })
        .cloned()
        .collect()
}

fn is_real_change(item: &OrderedItem, update: &OrderUpdate) -> bool {
    if item.sort_order != update.sort_order {
        return true;
    }
    match &update.group {
        GroupChange::Keep => false,
        GroupChange::To(group) => *group != item.group_id,
    }
}

/// Move `moved_id` to `to_index` (optionally into another group) and return
/// the minimal set of updates.
///
/// Positions are recomputed densely for the destination group and, on a
/// cross-group move, for the source group. `to_index` past the end appends.
pub fn reorder(
    current: &[OrderedItem],
    moved_id: &str,
    to_index: usize,
    to_group: &GroupChange,
) -> Result<Vec<OrderUpdate>> {
    let moved = current
        .iter()
        .find(|item| item.id == moved_id)
        .ok_or_else(|| Error::ItemNotFound(moved_id.to_string()))?;

    let source_group = moved.group_id.clone();
    let dest_group = match to_group {
        GroupChange::Keep => source_group.clone(),
        GroupChange::To(group) => group.clone(),
    };
    let changes_group = dest_group != source_group;

    let mut dest = members(current, dest_group.as_ref(), moved_id);
    dest.insert(to_index.min(dest.len()), moved);

    let mut proposed = Vec::with_capacity(current.len());
    for (position, item) in (0_i64..).zip(&dest) {
        let mut update = OrderUpdate::new(item.id.clone(), position);
        if changes_group && item.id == moved_id {
            update.group = GroupChange::To(dest_group.clone());
        }
        proposed.push(update);
    }
    if changes_group {
        let source = members(current, source_group.as_ref(), moved_id);
        proposed.extend(
            (0_i64..)
                .zip(&source)
                .map(|(position, item)| OrderUpdate::new(item.id.clone(), position)),
        );
    }

    Ok(diff(current, &proposed))
}

/// Items of `group` except `skip_id`, in current order (ties keep input order).
fn members<'a>(
    current: &'a [OrderedItem],
    group: Option<&String>,
    skip_id: &str,
) -> Vec<&'a OrderedItem> {
    let mut items: Vec<&OrderedItem> = current
        .iter()
        .filter(|item| item.id != skip_id && item.group_id.as_ref() == group)
        .collect();
    items.sort_by_key(|item| item.sort_order);
    items
}
