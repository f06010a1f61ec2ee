//! Requestor registry - per-node authorization and offer state

use ota_proto::CommandStatus;

use crate::identity::{RequestorId, RequestorMatcher};
use crate::token::UpdateToken;

pub const DEFAULT_MAX_REQUESTORS: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("requestor registry is full ({capacity} entries)")]
    ResourceExhausted { capacity: usize },
    #[error("no requestor matches {0}")]
    NotFound(RequestorMatcher),
}

impl RegistryError {
    /// Status reported to whoever issued the failing command
    pub fn status(&self) -> CommandStatus {
        match self {
            Self::ResourceExhausted { .. } => CommandStatus::ResourceExhausted,
            Self::NotFound(_) => CommandStatus::NotFound,
        }
    }
}

/// Everything the provider knows about one requesting node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestorEntry {
    id: RequestorId,
    /// Standing permission to receive updates
    pub ota_allowed: bool,
    /// Permission for a single update cycle, consumed by NotifyUpdateApplied
    pub ota_allowed_once: bool,
    /// An update was found while the requestor was not allowed to take it
    pub has_new_version: bool,
    /// Set on every offer; `None` until the first one
    pub update_token: Option<UpdateToken>,
    pub software_version: u32,
    pub software_version_string: String,
    /// BDX URI presented to the requestor
    pub image_uri: String,
    /// Where the provider itself fetches the image from
    pub ota_image_url: String,
    pub ota_image_size: u64,
}

impl RequestorEntry {
    fn new(id: RequestorId, ota_allowed: bool) -> Self {
        Self {
            id,
            ota_allowed,
            ota_allowed_once: false,
            has_new_version: false,
            update_token: None,
            software_version: 0,
            software_version_string: String::new(),
            image_uri: String::new(),
            ota_image_url: String::new(),
            ota_image_size: 0,
        }
    }

    pub fn id(&self) -> RequestorId {
        self.id
    }

    pub fn is_allowed(&self) -> bool {
        self.ota_allowed || self.ota_allowed_once
    }

    /// Does a token/version pair from ApplyUpdateRequest or
    /// NotifyUpdateApplied refer to the current offer?
    pub fn matches_offer(&self, token: &[u8], version: u32) -> bool {
        self.update_token.is_some_and(|t| t.matches(token)) && version == self.software_version
    }
}

/// Set of requestor entries keyed by identity, bounded by `capacity`
#[derive(Debug, Clone)]
pub struct RequestorRegistry {
    entries: Vec<RequestorEntry>,
    capacity: usize,
    default_allow: bool,
}

impl RequestorRegistry {
    pub fn new(capacity: usize, default_allow: bool) -> Self {
        Self { entries: Vec::new(), capacity, default_allow }
    }

    /// `ota_allowed` given to entries created from now on
    pub fn set_default_allow(&mut self, default_allow: bool) {
        self.default_allow = default_allow;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Existing entry for `id`, or a new one. The flag is true if the entry
    /// was created by this call.
    pub fn find_or_create(&mut self, id: RequestorId) -> Result<(&mut RequestorEntry, bool), RegistryError> {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            return Ok((&mut self.entries[pos], false));
        }

        let exhausted = RegistryError::ResourceExhausted { capacity: self.capacity };
        if self.entries.len() >= self.capacity {
            return Err(exhausted);
        }
        self.entries.try_reserve(1).map_err(|_| exhausted)?;

        self.entries.push(RequestorEntry::new(id, self.default_allow));
        let last = self.entries.len() - 1;
        Ok((&mut self.entries[last], true))
    }

    pub fn find(&self, id: &RequestorId) -> Option<&RequestorEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn find_mut(&mut self, id: &RequestorId) -> Option<&mut RequestorEntry> {
        self.entries.iter_mut().find(|e| e.id == *id)
    }

    /// Returns true if an entry existed
    pub fn remove(&mut self, id: &RequestorId) -> bool {
        match self.entries.iter().position(|e| e.id == *id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Grant permission to every matching entry: standing permission if
    /// `persistent`, otherwise a single update cycle. Returns how many
    /// entries matched.
    pub fn set_allowed(&mut self, matcher: &RequestorMatcher, persistent: bool) -> Result<usize, RegistryError> {
        self.update_matching(matcher, |entry| {
            if persistent {
                entry.ota_allowed = true;
            } else {
                entry.ota_allowed_once = true;
            }
        })
    }

    /// Revoke both kinds of permission from every matching entry
    pub fn set_disallowed(&mut self, matcher: &RequestorMatcher) -> Result<usize, RegistryError> {
        self.update_matching(matcher, |entry| {
            entry.ota_allowed = false;
            entry.ota_allowed_once = false;
        })
    }

    fn update_matching<F>(&mut self, matcher: &RequestorMatcher, mut f: F) -> Result<usize, RegistryError>
    where
        F: FnMut(&mut RequestorEntry),
    {
        let mut matched = 0;
        for entry in self.entries.iter_mut().filter(|e| matcher.matches(&e.id)) {
            f(entry);
            matched += 1;
        }

        if matched == 0 {
            return Err(RegistryError::NotFound(*matcher));
        }
        Ok(matched)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestorEntry> {
        self.entries.iter()
    }
}
