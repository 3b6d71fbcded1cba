// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Ordered, prefix-addressable key/value container carried by FCP messages.
// Author: Lukas Bower

//! Ordered field-set model.
//!
//! Keys are dotted paths: `Foo.Bar=1` stores `Bar=1` inside the subset `Foo`.
//! Insertion order is preserved at every level because some replies expose it
//! on the wire. Multi-valued keys use one canonical wire form, a single line
//! whose values are joined with [`MULTI_VALUE_CHAR`]. Repeated lines for the
//! same key on input are merged into that form.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between nested subset names inside a key.
pub const MULTI_LEVEL_CHAR: char = '.';
/// Separator between the values of a multi-valued key.
pub const MULTI_VALUE_CHAR: char = ';';

/// Errors raised while building or querying a [`FieldSet`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldSetError {
    /// A required key was absent.
    #[error("missing field {0}")]
    Missing(String),
    /// A present value could not be parsed as the requested type.
    #[error("cannot parse {key}={value} as {expected}")]
    Parse {
        /// Offending key.
        key: String,
        /// Raw value found on the wire.
        value: String,
        /// Name of the type the caller asked for.
        expected: &'static str,
    },
    /// `put_single` found an existing value for the key.
    #[error("field {0} already set")]
    Duplicate(String),
    /// The key was empty or contained a reserved character.
    #[error("illegal field name {0:?}")]
    IllegalKey(String),
    /// The value contained a newline, or a separator where one is not allowed.
    #[error("illegal value for field {0}")]
    IllegalValue(String),
}

impl FieldSetError {
    /// Key the error refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Missing(key)
            | Self::Duplicate(key)
            | Self::IllegalKey(key)
            | Self::IllegalValue(key) => key,
            Self::Parse { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Value(String),
    Subset(FieldSet),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PutMode {
    Single,
    Overwrite,
    Append,
    AppendFromRead,
}

/// Ordered mapping from dotted keys to values or nested subsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    entries: Vec<(String, Entry)>,
}

impl FieldSet {
    /// Create an empty field set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return true when neither values nor subsets are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a value, traversing subsets for dotted keys.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        match key.split_once(MULTI_LEVEL_CHAR) {
            None => self.value(key),
            Some((head, rest)) => self.direct_subset(head)?.get(rest),
        }
    }

    /// Look up a multi-valued key, splitting on [`MULTI_VALUE_CHAR`].
    ///
    /// Empty values at either end are kept, so `";a;"` yields `["", "a", ""]`.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Option<Vec<&str>> {
        self.get(key)
            .map(|value| value.split(MULTI_VALUE_CHAR).collect())
    }

    /// Look up a value that must be present.
    pub fn require(&self, key: &str) -> Result<&str, FieldSetError> {
        self.get(key)
            .ok_or_else(|| FieldSetError::Missing(key.to_owned()))
    }

    /// Parse a boolean, returning `default` when absent.
    ///
    /// `true`/`yes` and `false`/`no` are accepted in any case.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, FieldSetError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).ok_or_else(|| FieldSetError::Parse {
                key: key.to_owned(),
                value: raw.to_owned(),
                expected: "boolean",
            }),
        }
    }

    /// Parse an `i32`, returning `default` when absent.
    pub fn get_int(&self, key: &str, default: i32) -> Result<i32, FieldSetError> {
        self.parse_or(key, default, "int")
    }

    /// Parse an `i64`, returning `default` when absent.
    pub fn get_long(&self, key: &str, default: i64) -> Result<i64, FieldSetError> {
        self.parse_or(key, default, "long")
    }

    /// Parse an `i16`, returning `default` when absent.
    pub fn get_short(&self, key: &str, default: i16) -> Result<i16, FieldSetError> {
        self.parse_or(key, default, "short")
    }

    /// Decode a lowercase hex byte array, if present.
    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, FieldSetError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => hex::decode(raw)
                .map(Some)
                .map_err(|_| FieldSetError::Parse {
                    key: key.to_owned(),
                    value: raw.to_owned(),
                    expected: "hex bytes",
                }),
        }
    }

    /// Borrow the subset stored under a (possibly dotted) prefix.
    #[must_use]
    pub fn subset(&self, prefix: &str) -> Option<&FieldSet> {
        match prefix.split_once(MULTI_LEVEL_CHAR) {
            None => self.direct_subset(prefix),
            Some((head, rest)) => self.direct_subset(head)?.subset(rest),
        }
    }

    /// Set a key that must not already have a value.
    pub fn put_single(&mut self, key: &str, value: impl Into<String>) -> Result<(), FieldSetError> {
        self.put(key, value.into(), PutMode::Single)
    }

    /// Set a key, replacing any previous value.
    pub fn put_overwrite(
        &mut self,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), FieldSetError> {
        self.put(key, value.into(), PutMode::Overwrite)
    }

    /// Append a value to a multi-valued key.
    pub fn put_append(&mut self, key: &str, value: impl Into<String>) -> Result<(), FieldSetError> {
        self.put(key, value.into(), PutMode::Append)
    }

    /// Store an ordered sequence as one multi-valued key, replacing any previous value.
    pub fn put_all<S: AsRef<str>>(&mut self, key: &str, values: &[S]) -> Result<(), FieldSetError> {
        if values
            .iter()
            .any(|value| value.as_ref().contains(MULTI_VALUE_CHAR))
        {
            return Err(FieldSetError::IllegalValue(key.to_owned()));
        }
        let joined = values
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(&MULTI_VALUE_CHAR.to_string());
        self.put_overwrite(key, joined)
    }

    /// Store a boolean as `true`/`false`.
    pub fn put_bool(&mut self, key: &str, value: bool) -> Result<(), FieldSetError> {
        self.put_overwrite(key, if value { "true" } else { "false" })
    }

    /// Store a number in decimal.
    pub fn put_num<T: fmt::Display>(&mut self, key: &str, value: T) -> Result<(), FieldSetError> {
        self.put_overwrite(key, value.to_string())
    }

    /// Store a byte array as lowercase hex.
    pub fn put_bytes(&mut self, key: &str, value: &[u8]) -> Result<(), FieldSetError> {
        self.put_overwrite(key, hex::encode(value))
    }

    /// Attach a nested subset under `key`, merging into an existing subset.
    pub fn put_subset(&mut self, key: &str, subset: FieldSet) -> Result<(), FieldSetError> {
        for line in subset.lines() {
            let (name, value) = line
                .split_once('=')
                .ok_or_else(|| FieldSetError::IllegalKey(line.clone()))?;
            self.put_overwrite(&format!("{key}{MULTI_LEVEL_CHAR}{name}"), value)?;
        }
        Ok(())
    }

    /// Remove a value, returning it when present.
    pub fn remove_value(&mut self, key: &str) -> Option<String> {
        match key.split_once(MULTI_LEVEL_CHAR) {
            None => {
                let index = self
                    .entries
                    .iter()
                    .position(|(name, entry)| name == key && matches!(entry, Entry::Value(_)))?;
                match self.entries.remove(index).1 {
                    Entry::Value(value) => Some(value),
                    Entry::Subset(_) => None,
                }
            }
            Some((head, rest)) => {
                let subset = self.direct_subset_mut(head)?;
                let removed = subset.remove_value(rest);
                if subset.is_empty() {
                    self.entries
                        .retain(|(name, entry)| !(name == head && matches!(entry, Entry::Subset(_))));
                }
                removed
            }
        }
    }

    /// Iterate over the direct (non-nested) values in insertion order.
    pub fn direct_values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(name, entry)| match entry {
            Entry::Value(value) => Some((name.as_str(), value.as_str())),
            Entry::Subset(_) => None,
        })
    }

    /// Iterate over the direct subsets in insertion order.
    pub fn direct_subsets(&self) -> impl Iterator<Item = (&str, &FieldSet)> {
        self.entries.iter().filter_map(|(name, entry)| match entry {
            Entry::Subset(subset) => Some((name.as_str(), subset)),
            Entry::Value(_) => None,
        })
    }

    /// Render the set as `Key=Value` lines, nested keys prefixed by their subset path.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_lines("", &mut out);
        out
    }

    /// Parse `Key=Value` lines, merging repeated keys into multi-valued form.
    pub fn from_lines<'a, I>(lines: I) -> Result<Self, FieldSetError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut fields = Self::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            fields.put_line(line)?;
        }
        Ok(fields)
    }

    /// Parse one `Key=Value` line as read from the wire.
    pub fn put_line(&mut self, line: &str) -> Result<(), FieldSetError> {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| FieldSetError::IllegalKey(line.to_owned()))?;
        self.put(key.trim(), value.to_owned(), PutMode::AppendFromRead)
    }

    fn parse_or<T: FromStr>(
        &self,
        key: &str,
        default: T,
        expected: &'static str,
    ) -> Result<T, FieldSetError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| FieldSetError::Parse {
                key: key.to_owned(),
                value: raw.to_owned(),
                expected,
            }),
        }
    }

    fn value(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|(name, entry)| match entry {
            Entry::Value(value) if name == key => Some(value.as_str()),
            _ => None,
        })
    }

    fn direct_subset(&self, key: &str) -> Option<&FieldSet> {
        self.entries.iter().find_map(|(name, entry)| match entry {
            Entry::Subset(subset) if name == key => Some(subset),
            _ => None,
        })
    }

    fn direct_subset_mut(&mut self, key: &str) -> Option<&mut FieldSet> {
        self.entries.iter_mut().find_map(|(name, entry)| match entry {
            Entry::Subset(subset) if name == key => Some(subset),
            _ => None,
        })
    }

    fn put(&mut self, key: &str, value: String, mode: PutMode) -> Result<(), FieldSetError> {
        if value.contains('\n') || value.contains('\r') {
            return Err(FieldSetError::IllegalValue(key.to_owned()));
        }
        if mode == PutMode::Append && value.contains(MULTI_VALUE_CHAR) {
            return Err(FieldSetError::IllegalValue(key.to_owned()));
        }
        for segment in key.split(MULTI_LEVEL_CHAR) {
            validate_name(key, segment)?;
        }
        self.put_path(key, key, value, mode)
    }

    fn put_path(
        &mut self,
        full_key: &str,
        key: &str,
        value: String,
        mode: PutMode,
    ) -> Result<(), FieldSetError> {
        if let Some((head, rest)) = key.split_once(MULTI_LEVEL_CHAR) {
            if self.direct_subset(head).is_none() {
                self.entries
                    .push((head.to_owned(), Entry::Subset(FieldSet::new())));
            }
            return match self.direct_subset_mut(head) {
                Some(subset) => subset.put_path(full_key, rest, value, mode),
                None => Err(FieldSetError::IllegalKey(full_key.to_owned())),
            };
        }
        let position = self
            .entries
            .iter()
            .position(|(name, entry)| name == key && matches!(entry, Entry::Value(_)));
        match (position, mode) {
            (None, _) => {
                self.entries.push((key.to_owned(), Entry::Value(value)));
                Ok(())
            }
            (Some(_), PutMode::Single) => Err(FieldSetError::Duplicate(full_key.to_owned())),
            (Some(index), PutMode::Overwrite) => {
                self.entries[index].1 = Entry::Value(value);
                Ok(())
            }
            (Some(index), PutMode::Append | PutMode::AppendFromRead) => {
                if let Entry::Value(current) = &mut self.entries[index].1 {
                    current.push(MULTI_VALUE_CHAR);
                    current.push_str(&value);
                }
                Ok(())
            }
        }
    }

    fn collect_lines(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, entry) in &self.entries {
            match entry {
                Entry::Value(value) => out.push(format!("{prefix}{name}={value}")),
                Entry::Subset(subset) => {
                    let nested = format!("{prefix}{name}{MULTI_LEVEL_CHAR}");
                    subset.collect_lines(&nested, out);
                }
            }
        }
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

fn validate_name(full_key: &str, name: &str) -> Result<(), FieldSetError> {
    if name.is_empty() || name.contains('=') || name.contains('\n') {
        return Err(FieldSetError::IllegalKey(full_key.to_owned()));
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") || raw.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}
