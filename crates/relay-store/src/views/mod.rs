//! Secondary index engine.
//!
//! A view is a named, grouped, ordered projection of one collection.  Each
//! record is classified into zero or more `(group, sort key)` placements;
//! rows inside a group are ordered by `(SortKey, unique_id)` so equal keys
//! break ties deterministically.
//!
//! Views live in an [`IndexState`] that is shared copy-on-write: readers hold
//! an `Arc` snapshot while a write transaction mutates its own working copy.
//! Groups and the id-to-placement map are individually `Arc`ed, so a write
//! only clones what it touches.

pub mod builtin;

use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::Result;
use crate::notifications::ViewChangeSet;
use crate::record::{Collection, StoredRecord};

const LOCATION_SHARDS: usize = 32;

// ---------------------------------------------------------------------------
// Keys and placements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    Int(i64),
    /// Sorts larger values first.
    Desc(Reverse<i64>),
    Text(String),
}

/// Ordering key of a row within its group.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey(pub Vec<KeyPart>);

impl SortKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(mut self, value: i64) -> Self {
        self.0.push(KeyPart::Int(value));
        self
    }

    pub fn desc(mut self, value: i64) -> Self {
        self.0.push(KeyPart::Desc(Reverse(value)));
        self
    }

    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.0.push(KeyPart::Text(value.into()));
        self
    }
}

/// Where a record sits in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub group: String,
    pub key: SortKey,
}

impl Placement {
    pub fn new(group: impl Into<String>, key: SortKey) -> Self {
        Self {
            group: group.into(),
            key,
        }
    }
}

type Row = (SortKey, String);

/// Grouping and ordering rules of a view.
pub trait ViewDefinition: Send + Sync {
    fn name(&self) -> &str;

    /// Collection whose records the view indexes.
    fn collection(&self) -> Collection;

    /// Views that must be registered first.  When a group of a dependency
    /// changes, the record whose id equals that group is re-classified here.
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }

    /// Placements of `record`; empty when it is not a member.  `index` holds
    /// every view registered before this one, already updated for the
    /// current change.
    fn classify(&self, record: &StoredRecord, index: &IndexState) -> Vec<Placement>;
}

// ---------------------------------------------------------------------------
// ViewIndex
// ---------------------------------------------------------------------------

/// Materialized rows of one view.
#[derive(Clone)]
pub struct ViewIndex {
    definition: Arc<dyn ViewDefinition>,
    groups: BTreeMap<String, Arc<BTreeSet<Row>>>,
    locations: Vec<Arc<HashMap<String, Vec<Placement>>>>,
}

impl ViewIndex {
    pub fn new(definition: Arc<dyn ViewDefinition>) -> Self {
        Self {
            definition,
            groups: BTreeMap::new(),
            locations: (0..LOCATION_SHARDS)
                .map(|_| Arc::new(HashMap::new()))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &Arc<dyn ViewDefinition> {
        &self.definition
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn group_len(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |rows| rows.len())
    }

    /// Ids of `group` in view order.
    pub fn group_ids(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|rows| rows.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn first_in_group(&self, group: &str) -> Option<&str> {
        self.groups
            .get(group)
            .and_then(|rows| rows.iter().next())
            .map(|(_, id)| id.as_str())
    }

    pub fn last_in_group(&self, group: &str) -> Option<&str> {
        self.groups
            .get(group)
            .and_then(|rows| rows.iter().next_back())
            .map(|(_, id)| id.as_str())
    }

    /// Total number of rows across all groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(|rows| rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn placements(&self, id: &str) -> &[Placement] {
        self.locations[shard_of(id)]
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, id: &str) -> bool {
        !self.placements(id).is_empty()
    }

    /// Move `id` to `placements`, returning where it was before.
    fn place(&mut self, id: &str, placements: Vec<Placement>) -> Vec<Placement> {
        let shard = Arc::make_mut(&mut self.locations[shard_of(id)]);
        let old = if placements.is_empty() {
            shard.remove(id).unwrap_or_default()
        } else {
            shard
                .insert(id.to_string(), placements.clone())
                .unwrap_or_default()
        };
        if old == placements {
            return old;
        }

        for p in &old {
            if let Some(rows) = self.groups.get_mut(&p.group) {
                Arc::make_mut(rows).remove(&(p.key.clone(), id.to_string()));
                if rows.is_empty() {
                    self.groups.remove(&p.group);
                }
            }
        }
        for p in placements {
            let rows = self.groups.entry(p.group).or_default();
            Arc::make_mut(rows).insert((p.key, id.to_string()));
        }
        old
    }
}

fn shard_of(id: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() as usize) % LOCATION_SHARDS
}

// ---------------------------------------------------------------------------
// IndexState
// ---------------------------------------------------------------------------

/// All ready views, in registration order.
#[derive(Clone, Default)]
pub struct IndexState {
    views: Vec<Arc<ViewIndex>>,
}

impl IndexState {
    pub fn view(&self, name: &str) -> Option<&ViewIndex> {
        self.views
            .iter()
            .find(|v| v.name() == name)
            .map(|v| v.as_ref())
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.view(name).is_some()
    }

    pub fn view_names(&self) -> Vec<&str> {
        self.views.iter().map(|v| v.name()).collect()
    }

    pub fn group_len(&self, view: &str, group: &str) -> usize {
        self.view(view).map_or(0, |v| v.group_len(group))
    }

    pub fn group_ids(&self, view: &str, group: &str) -> Vec<String> {
        self.view(view)
            .map(|v| v.group_ids(group))
            .unwrap_or_default()
    }

    pub fn placements(&self, view: &str, id: &str) -> &[Placement] {
        self.view(view).map_or(&[], |v| v.placements(id))
    }

    /// Populate a new view from every record of its collection and append
    /// it after the existing views.
    pub(crate) fn push_view<I>(&mut self, definition: Arc<dyn ViewDefinition>, records: I)
    where
        I: IntoIterator<Item = StoredRecord>,
    {
        let mut view = ViewIndex::new(definition);
        for record in records {
            let placements = view.definition.classify(&record, self);
            if !placements.is_empty() {
                view.place(record.unique_id(), placements);
            }
        }
        self.views.push(Arc::new(view));
    }

    /// Bring every view of `collection` up to date with the new state of
    /// record `id` (`None` when it was deleted), then cascade to dependent
    /// views.
    pub(crate) fn apply(
        &mut self,
        collection: Collection,
        id: &str,
        record: Option<&StoredRecord>,
        loader: &mut dyn FnMut(Collection, &str) -> Result<Option<StoredRecord>>,
        changes: &mut ViewChangeSet,
    ) -> Result<()> {
        for i in 0..self.views.len() {
            if self.views[i].definition.collection() == collection {
                self.reclassify(i, id, record, loader, changes)?;
            }
        }
        Ok(())
    }

    fn reclassify(
        &mut self,
        index: usize,
        id: &str,
        record: Option<&StoredRecord>,
        loader: &mut dyn FnMut(Collection, &str) -> Result<Option<StoredRecord>>,
        changes: &mut ViewChangeSet,
    ) -> Result<()> {
        let placements = match record {
            Some(r) => self.views[index].definition.classify(r, self),
            None => Vec::new(),
        };

        let view = Arc::make_mut(&mut self.views[index]);
        let old = view.place(id, placements.clone());
        if old.is_empty() && placements.is_empty() {
            return Ok(());
        }

        let name = view.name().to_string();
        for p in old.iter().chain(&placements) {
            changes.touch(&name, &p.group, id);
        }
        if old == placements {
            return Ok(());
        }

        let changed: BTreeSet<String> = old
            .into_iter()
            .chain(placements)
            .map(|p| p.group)
            .collect();

        for dependent in (index + 1)..self.views.len() {
            let definition = Arc::clone(&self.views[dependent].definition);
            if !definition.dependencies().contains(&name.as_str()) {
                continue;
            }
            for group in &changed {
                match loader(definition.collection(), group)? {
                    Some(dep) => self.reclassify(dependent, group, Some(&dep), loader, changes)?,
                    None if self.views[dependent].contains(group) => {
                        self.reclassify(dependent, group, None, loader, changes)?
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }
}
