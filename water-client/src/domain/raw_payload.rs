/// One header-keyed record from a downloaded usage file.
///
/// Columns keep the order they appeared in the header row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageRow {
    fields: Vec<(String, String)>,
}

impl UsageRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.fields.push((column.into(), value.into()));
    }

    /// Value of the first column named exactly `column`.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for UsageRow
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// What a retriever hands to the extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum RawUsagePayload {
    /// Records from a downloaded CSV, oldest first.
    Rows(Vec<UsageRow>),
    /// Usage element text from the HTML front-end, already reduced to a
    /// numeric string.
    Text(String),
}

impl RawUsagePayload {
    pub fn row_count(&self) -> Option<u64> {
        match self {
            Self::Rows(rows) => Some(rows.len() as u64),
            Self::Text(_) => None,
        }
    }
}
