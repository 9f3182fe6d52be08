use serde::{Deserialize, Deserializer};

use super::condition::Ordered;

/// Look up (or create) a value-object row and store its identifier instead of the value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueReference {
    pub foreign_table: String,
    /// Column read back from the foreign row, usually `uid`.
    pub foreign_field: String,
    /// Column of the foreign row holding the source value.
    pub value_field: String,
    /// Target column receiving the identifier.
    pub target_property: String,
    /// Source columns copied onto the foreign row and included in its identity.
    #[serde(default)]
    pub unique_by: Vec<String>,
}

/// The source value is a file identifier to attach once the target row exists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub target_property: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
enum SpecialTarget {
    ValueReference(ValueReference),
    FileReference(FileReference),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyTarget {
    Copy(String),
    ValueReference(ValueReference),
    FileReference(FileReference),
}

impl<'de> Deserialize<'de> for PropertyTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Column(String),
            Special(SpecialTarget),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Column(column) => PropertyTarget::Copy(column),
            Raw::Special(SpecialTarget::ValueReference(spec)) => {
                PropertyTarget::ValueReference(spec)
            }
            Raw::Special(SpecialTarget::FileReference(spec)) => PropertyTarget::FileReference(spec),
        })
    }
}

/// Ordered `source column -> target` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    entries: Vec<(String, PropertyTarget)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.set(source.into(), PropertyTarget::Copy(target.into()));
        self
    }

    pub fn value_reference(mut self, source: impl Into<String>, spec: ValueReference) -> Self {
        self.set(source.into(), PropertyTarget::ValueReference(spec));
        self
    }

    pub fn file_reference(
        mut self,
        source: impl Into<String>,
        target_property: impl Into<String>,
    ) -> Self {
        self.set(
            source.into(),
            PropertyTarget::FileReference(FileReference {
                target_property: target_property.into(),
            }),
        );
        self
    }

    /// Adds or replaces the entry for `source`.
    pub fn set(&mut self, source: String, target: PropertyTarget) {
        match self.entries.iter_mut().find(|(s, _)| *s == source) {
            Some(entry) => entry.1 = target,
            None => self.entries.push((source, target)),
        }
    }

    pub fn entries(&self) -> &[(String, PropertyTarget)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(s, _)| s.as_str())
    }

    pub(crate) fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|(source, _)| keep(source));
    }
}

impl<'de> Deserialize<'de> for PropertyMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Ordered(entries) = Ordered::<PropertyTarget>::deserialize(deserializer)?;
        Ok(PropertyMap { entries })
    }
}

/// Plain `source -> target` column pairs, as used for unique value records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap(Vec<(String, String)>);

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.0.push((source.into(), target.into()));
        self
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(s, _)| s.as_str())
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(_, t)| t.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<'de> Deserialize<'de> for ColumnMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Ordered(entries) = Ordered::<String>::deserialize(deserializer)?;
        Ok(ColumnMap(entries))
    }
}
