use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Note};

/// A NIP-01 subscription filter. Values within a field are OR'd, fields
/// are AND'd. Construct one with [`Filter::new`].
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone, Default)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    until: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    /// `#<letter>` tag queries, keyed with the leading `#`
    #[serde(flatten)]
    tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> FilterBuilder {
        FilterBuilder::default()
    }

    pub fn json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s).map_err(Into::into)
    }

    pub fn ids(&self) -> Option<&[String]> {
        self.ids.as_deref()
    }

    pub fn authors(&self) -> Option<&[String]> {
        self.authors.as_deref()
    }

    pub fn kinds(&self) -> Option<&[u32]> {
        self.kinds.as_deref()
    }

    pub fn since(&self) -> Option<u64> {
        self.since
    }

    pub fn until(&self) -> Option<u64> {
        self.until
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn tag(&self, letter: char) -> Option<&[String]> {
        self.tags.get(&format!("#{letter}")).map(Vec::as_slice)
    }

    /// Whether `note` satisfies every field of this filter. `limit` is not
    /// considered.
    pub fn matches(&self, note: &Note) -> bool {
        if let Some(ids) = &self.ids {
            let id = note.id.hex();
            if !ids.iter().any(|i| *i == id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            let pk = note.pubkey.hex();
            if !authors.iter().any(|a| *a == pk) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&note.kind) {
                return false;
            }
        }

        if self.since.is_some_and(|since| note.created_at < since) {
            return false;
        }

        if self.until.is_some_and(|until| note.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            note.tags_named(name)
                .filter_map(|tag| tag.get(1))
                .any(|v| values.contains(v))
        })
    }
}

fn extend<T>(field: &mut Option<Vec<T>>, values: impl IntoIterator<Item = T>) {
    field.get_or_insert_with(Vec::new).extend(values);
}

/// Accumulates filter fields. List setters append when called again,
/// scalar setters overwrite.
#[derive(Debug, Default, Clone)]
pub struct FilterBuilder {
    filter: Filter,
}

impl FilterBuilder {
    pub fn ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        extend(&mut self.filter.ids, ids.into_iter().map(Into::into));
        self
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        extend(&mut self.filter.authors, authors.into_iter().map(Into::into));
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        extend(&mut self.filter.kinds, kinds);
        self
    }

    pub fn tag<S: Into<String>>(mut self, letter: char, values: impl IntoIterator<Item = S>) -> Self {
        self.filter
            .tags
            .entry(format!("#{letter}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// `#e` shorthand
    pub fn events<S: Into<String>>(self, ids: impl IntoIterator<Item = S>) -> Self {
        self.tag('e', ids)
    }

    /// `#p` shorthand
    pub fn pubkeys<S: Into<String>>(self, pubkeys: impl IntoIterator<Item = S>) -> Self {
        self.tag('p', pubkeys)
    }

    pub fn since(mut self, since: u64) -> Self {
        self.filter.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.filter.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.filter.limit = Some(limit);
        self
    }

    pub fn build(self) -> Filter {
        self.filter
    }
}
