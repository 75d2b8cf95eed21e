//! Known groups and the group the user is currently in.
//!
//! Names are normalized before any comparison: surrounding whitespace is
//! trimmed, inner whitespace runs become one space, case is kept. So
//! `"  Rust   Fans "` and `"Rust Fans"` are the same group, `"rust fans"`
//! is a different one.

use std::collections::BTreeSet;

use parley_protocol::types::GroupName;
use tracing::debug;

use crate::error::StateError;

#[derive(Debug)]
pub struct GroupDirectory {
    known: BTreeSet<GroupName>,
    current: Option<GroupName>,
    max_name_len: usize,
}

impl GroupDirectory {
    pub fn new(max_name_len: usize) -> Self {
        Self {
            known: BTreeSet::new(),
            current: None,
            max_name_len,
        }
    }

    /// Normalize `raw` or explain why it is not a valid group name.
    pub fn normalize(&self, raw: &str) -> Result<GroupName, StateError> {
        let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if name.is_empty() {
            return Err(StateError::InvalidGroupName("name is empty".into()));
        }
        if name.chars().any(char::is_control) {
            return Err(StateError::InvalidGroupName(
                "name contains control characters".into(),
            ));
        }
        let len = name.chars().count();
        if len > self.max_name_len {
            return Err(StateError::InvalidGroupName(format!(
                "name is {len} characters, limit is {}",
                self.max_name_len
            )));
        }
        Ok(name)
    }

    /// Create a group locally. The local directory is authoritative: a name
    /// already known is a duplicate even if the relay never confirmed it.
    pub fn create(&mut self, raw: &str) -> Result<GroupName, StateError> {
        let name = self.normalize(raw)?;
        if !self.known.insert(name.clone()) {
            return Err(StateError::DuplicateGroup(name));
        }
        debug!(group = %name, "group created");
        Ok(name)
    }

    /// Learn about a group from the relay. Returns whether it was new.
    pub fn record_created(&mut self, raw: &str) -> bool {
        match self.normalize(raw) {
            Ok(name) => self.known.insert(name),
            Err(e) => {
                debug!(name = raw, "ignoring group: {e}");
                false
            }
        }
    }

    /// Make `raw` the current group. The group does not need to be known yet.
    pub fn join(&mut self, raw: &str) -> Result<GroupName, StateError> {
        let name = self.normalize(raw)?;
        self.current = Some(name.clone());
        Ok(name)
    }

    pub fn known_groups(&self) -> &BTreeSet<GroupName> {
        &self.known
    }

    pub fn current(&self) -> Option<&GroupName> {
        self.current.as_ref()
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.normalize(name).is_ok_and(|name| self.known.contains(&name))
    }
}
