//! Loading the TPC-DS query set from disk.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Result, TpcdsError, read_file};

/// A single query of the stress workload.
#[derive(Debug, Clone)]
pub struct StressQuery {
    /// 1-based position in the sorted query directory.
    pub index: usize,
    pub path: PathBuf,
    pub sql: String,
}

/// Ordered set of queries, sorted by file name.
#[derive(Debug, Clone, Default)]
pub struct QuerySet {
    queries: Vec<StressQuery>,
}

impl QuerySet {
    /// Build a query set from in-memory texts, numbering them from 1.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queries = texts
            .into_iter()
            .enumerate()
            .map(|(position, sql)| StressQuery {
                index: position + 1,
                path: PathBuf::new(),
                sql: sql.into(),
            })
            .collect();
        Self { queries }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StressQuery> {
        self.queries.iter()
    }

    pub fn get(&self, index: usize) -> Option<&StressQuery> {
        index.checked_sub(1).and_then(|pos| self.queries.get(pos))
    }
}

impl<'a> IntoIterator for &'a QuerySet {
    type Item = &'a StressQuery;
    type IntoIter = std::slice::Iter<'a, StressQuery>;

    fn into_iter(self) -> Self::IntoIter {
        self.queries.iter()
    }
}

/// Read every file of `dir` in lexical file-name order.
///
/// Subdirectories are ignored. The file contents are used verbatim, so a file
/// may hold several statements.
pub fn load_query_set(dir: &Path) -> Result<QuerySet> {
    let entries = fs::read_dir(dir).map_err(|source| TpcdsError::io(dir, source))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| TpcdsError::io(dir, source))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let mut queries = Vec::with_capacity(files.len());
    for (position, path) in files.into_iter().enumerate() {
        let sql = read_file(&path)?;
        queries.push(StressQuery {
            index: position + 1,
            path,
            sql,
        });
    }
    tracing::debug!(
        target: "tpcds-stress",
        dir = %dir.display(),
        count = queries.len(),
        "loaded query set"
    );
    Ok(QuerySet { queries })
}

/// 1-based query indices that the runner skips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeList(BTreeSet<usize>);

impl ExcludeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    pub fn insert(&mut self, index: usize) -> bool {
        self.0.insert(index)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<usize> for ExcludeList {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for ExcludeList {
    type Err = TpcdsError;

    /// Parse a comma separated list such as `"3, 17,64"`.
    fn from_str(raw: &str) -> Result<Self> {
        let mut list = ExcludeList::new();
        for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let index = token
                .parse::<usize>()
                .map_err(|err| TpcdsError::Parse(format!("query index '{token}': {err}")))?;
            if index == 0 {
                return Err(TpcdsError::Parse(
                    "query indices start at 1, got 0".to_string(),
                ));
            }
            list.insert(index);
        }
        Ok(list)
    }
}
