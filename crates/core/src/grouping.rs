//! Derived grouping of entities into display buckets.
//!
//! Groups are never persisted on their own: they are recomputed from the entity
//! map and the active [`Filter`] whenever either changes.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{EntityKey, EntityRecord};

/// Display bucket an entity falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Live,
    Today,
    ThisWeek,
    Upcoming,
    Earlier,
    Archived,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::Live,
        Bucket::Today,
        Bucket::ThisWeek,
        Bucket::Upcoming,
        Bucket::Earlier,
        Bucket::Archived,
    ];
}

/// Date window applied to non-live entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRange {
    #[default]
    All,
    Today,
    Week,
    Month,
}

/// Ordering of keys inside each bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    StartsAtAsc,
    StartsAtDesc,
    UpdatedAtDesc,
    PriorityDesc,
}

/// Active view filter held by the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub range: DateRange,
    pub sort: SortOrder,
    pub show_archived: bool,
}

impl Filter {
    /// Query parameters used to scope diff fetches.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let range = match self.range {
            DateRange::All => "all",
            DateRange::Today => "today",
            DateRange::Week => "week",
            DateRange::Month => "month",
        };
        let sort = match self.sort {
            SortOrder::StartsAtAsc => "starts_at_asc",
            SortOrder::StartsAtDesc => "starts_at_desc",
            SortOrder::UpdatedAtDesc => "updated_at_desc",
            SortOrder::PriorityDesc => "priority_desc",
        };
        vec![
            ("range", range.to_string()),
            ("sort", sort.to_string()),
            ("archived", self.show_archived.to_string()),
        ]
    }
}

/// Partition of visible entity keys into buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Groups {
    pub live: Vec<EntityKey>,
    pub today: Vec<EntityKey>,
    pub this_week: Vec<EntityKey>,
    pub upcoming: Vec<EntityKey>,
    pub earlier: Vec<EntityKey>,
    pub archived: Vec<EntityKey>,
}

impl Groups {
    pub fn bucket(&self, bucket: Bucket) -> &[EntityKey] {
        match bucket {
            Bucket::Live => &self.live,
            Bucket::Today => &self.today,
            Bucket::ThisWeek => &self.this_week,
            Bucket::Upcoming => &self.upcoming,
            Bucket::Earlier => &self.earlier,
            Bucket::Archived => &self.archived,
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<EntityKey> {
        match bucket {
            Bucket::Live => &mut self.live,
            Bucket::Today => &mut self.today,
            Bucket::ThisWeek => &mut self.this_week,
            Bucket::Upcoming => &mut self.upcoming,
            Bucket::Earlier => &mut self.earlier,
            Bucket::Archived => &mut self.archived,
        }
    }

    /// Visible keys in bucket order.
    pub fn visible_keys(&self) -> impl Iterator<Item = &EntityKey> {
        Bucket::ALL
            .into_iter()
            .flat_map(move |bucket| self.bucket(bucket).iter())
    }

    pub fn len(&self) -> usize {
        Bucket::ALL
            .iter()
            .map(|bucket| self.bucket(*bucket).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bucket for one entity relative to `now`.
pub fn classify(entity: &EntityRecord, now: DateTime<Utc>) -> Bucket {
    if entity.status.is_archived() {
        return Bucket::Archived;
    }
    if entity.status.is_active() {
        return Bucket::Live;
    }
    let Some(reference) = entity.reference_time() else {
        return Bucket::Earlier;
    };
    if reference.date_naive() == now.date_naive() {
        return Bucket::Today;
    }
    if reference.iso_week() == now.iso_week() {
        return Bucket::ThisWeek;
    }
    if reference > now {
        Bucket::Upcoming
    } else {
        Bucket::Earlier
    }
}

fn in_range(entity: &EntityRecord, range: DateRange, now: DateTime<Utc>) -> bool {
    if range == DateRange::All || entity.status.is_active() {
        return true;
    }
    let Some(reference) = entity.reference_time() else {
        return false;
    };
    match range {
        DateRange::All => true,
        DateRange::Today => reference.date_naive() == now.date_naive(),
        DateRange::Week => reference.iso_week() == now.iso_week(),
        DateRange::Month => reference.year() == now.year() && reference.month() == now.month(),
    }
}

/// Descending comparison that keeps missing values last.
fn desc_none_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn asc_none_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare(a: &EntityRecord, b: &EntityRecord, sort: SortOrder) -> Ordering {
    let primary = match sort {
        SortOrder::StartsAtAsc => asc_none_last(a.reference_time(), b.reference_time()),
        SortOrder::StartsAtDesc => desc_none_last(a.reference_time(), b.reference_time()),
        SortOrder::UpdatedAtDesc => desc_none_last(a.updated_at, b.updated_at),
        SortOrder::PriorityDesc => b
            .priority
            .cmp(&a.priority)
            .then_with(|| asc_none_last(a.reference_time(), b.reference_time())),
    };
    primary.then_with(|| a.key.cmp(&b.key))
}

/// Recompute groups from the full entity set.
pub fn compute_groups<'a>(
    entities: impl IntoIterator<Item = &'a EntityRecord>,
    filter: &Filter,
    now: DateTime<Utc>,
) -> Groups {
    let mut visible: Vec<(Bucket, &EntityRecord)> = entities
        .into_iter()
        .filter(|entity| in_range(entity, filter.range, now))
        .map(|entity| (classify(entity, now), entity))
        .filter(|(bucket, _)| filter.show_archived || *bucket != Bucket::Archived)
        .collect();
    visible.sort_by(|(_, a), (_, b)| compare(a, b, filter.sort));

    let mut groups = Groups::default();
    for (bucket, entity) in visible {
        groups.bucket_mut(bucket).push(entity.key.clone());
    }
    groups
}
