//! Collections and the typed record codec.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::models::{Attachment, Message, Tag, Thread};

/// Namespace a record's unique id lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Threads,
    Interactions,
    Attachments,
    Tags,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Threads,
        Collection::Interactions,
        Collection::Attachments,
        Collection::Tags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threads => "threads",
            Self::Interactions => "interactions",
            Self::Attachments => "attachments",
            Self::Tags => "tags",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded record of any collection, as seen by the index engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecord {
    Thread(Thread),
    Message(Message),
    Attachment(Attachment),
    Tag(Tag),
}

impl StoredRecord {
    pub fn collection(&self) -> Collection {
        match self {
            Self::Thread(_) => Collection::Threads,
            Self::Message(_) => Collection::Interactions,
            Self::Attachment(_) => Collection::Attachments,
            Self::Tag(_) => Collection::Tags,
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Thread(t) => &t.unique_id,
            Self::Message(m) => &m.unique_id,
            Self::Attachment(a) => &a.unique_id,
            Self::Tag(t) => &t.unique_id,
        }
    }

    /// Decode a `records.data` blob belonging to `collection`.
    pub fn decode(collection: Collection, data: &[u8]) -> Result<Self> {
        Ok(match collection {
            Collection::Threads => Self::Thread(bincode::deserialize(data)?),
            Collection::Interactions => Self::Message(bincode::deserialize(data)?),
            Collection::Attachments => Self::Attachment(bincode::deserialize(data)?),
            Collection::Tags => Self::Tag(bincode::deserialize(data)?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Thread(t) => bincode::serialize(t)?,
            Self::Message(m) => bincode::serialize(m)?,
            Self::Attachment(a) => bincode::serialize(a)?,
            Self::Tag(t) => bincode::serialize(t)?,
        })
    }

    pub fn as_thread(&self) -> Option<&Thread> {
        match self {
            Self::Thread(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> Option<&Tag> {
        match self {
            Self::Tag(t) => Some(t),
            _ => None,
        }
    }
}

/// A model type stored in exactly one collection.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const COLLECTION: Collection;

    fn unique_id(&self) -> &str;

    fn to_stored(&self) -> StoredRecord;

    fn from_stored(record: StoredRecord) -> Option<Self>;

    fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

macro_rules! impl_record {
    ($ty:ty, $collection:expr, $variant:ident) => {
        impl Record for $ty {
            const COLLECTION: Collection = $collection;

            fn unique_id(&self) -> &str {
                &self.unique_id
            }

            fn to_stored(&self) -> StoredRecord {
                StoredRecord::$variant(self.clone())
            }

            fn from_stored(record: StoredRecord) -> Option<Self> {
                match record {
                    StoredRecord::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

impl_record!(Thread, Collection::Threads, Thread);
impl_record!(Message, Collection::Interactions, Message);
impl_record!(Attachment, Collection::Attachments, Attachment);
impl_record!(Tag, Collection::Tags, Tag);

/// Map a decode failure of persisted data to a corruption error.
pub(crate) fn corrupt(collection: Collection, id: &str, err: StoreError) -> StoreError {
    StoreError::Corrupt(format!("{collection}/{id}: {err}"))
}
