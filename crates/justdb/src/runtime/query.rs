use crate::StorageError;
use crate::record::Record;
use crate::RecordStore;
use justdb_schema::Value;
use std::collections::VecDeque;

/// Which soft-deleted records reads may see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    include_deleted: bool,
}

impl ReadOptions {
    /// Live records only. The default.
    pub fn live() -> Self {
        Self::default()
    }

    /// Live and soft-deleted records.
    pub fn include_deleted() -> Self {
        Self {
            include_deleted: true,
        }
    }

    pub fn includes_deleted(&self) -> bool {
        self.include_deleted
    }

    pub(crate) fn admits(&self, record: &Record) -> bool {
        self.include_deleted || record.is_live()
    }
}

#[derive(Debug, Clone)]
enum Selection {
    Nothing,
    All,
    Key(Value),
    Where { field: String, value: Value },
}

/// A lazy, restartable sequence of records.
///
/// Nothing is read until [`Query::iter`] is advanced; records are fetched
/// from the store a page at a time. Each call to `iter` starts over, so the
/// sequence reflects the store at the time it is walked.
#[derive(Debug)]
pub struct Query<'a, S: ?Sized> {
    store: &'a S,
    entity: String,
    key_field: String,
    selection: Selection,
    options: ReadOptions,
    page_size: usize,
}

/// Records reached through a relationship.
pub type Related<'a, S> = Query<'a, S>;

impl<'a, S: RecordStore + ?Sized> Query<'a, S> {
    fn with_selection(
        store: &'a S,
        entity: &str,
        key_field: &str,
        selection: Selection,
        options: ReadOptions,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            entity: entity.to_string(),
            key_field: key_field.to_string(),
            selection,
            options,
            page_size: page_size.max(1),
        }
    }

    pub(crate) fn all(
        store: &'a S,
        entity: &str,
        key_field: &str,
        options: ReadOptions,
        page_size: usize,
    ) -> Self {
        Self::with_selection(store, entity, key_field, Selection::All, options, page_size)
    }

    pub(crate) fn by_key(
        store: &'a S,
        entity: &str,
        key_field: &str,
        key: Value,
        options: ReadOptions,
    ) -> Self {
        let selection = if key.is_null() {
            Selection::Nothing
        } else {
            Selection::Key(key)
        };
        Self::with_selection(store, entity, key_field, selection, options, 1)
    }

    pub(crate) fn matching(
        store: &'a S,
        entity: &str,
        key_field: &str,
        field: &str,
        value: Value,
        options: ReadOptions,
        page_size: usize,
    ) -> Self {
        let selection = Selection::Where {
            field: field.to_string(),
            value,
        };
        Self::with_selection(store, entity, key_field, selection, options, page_size)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Walk the sequence from the start.
    pub fn iter(&self) -> Cursor<'_, 'a, S> {
        Cursor {
            query: self,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Read the whole sequence.
    pub fn to_vec(&self) -> Result<Vec<Record>, StorageError> {
        self.iter().collect()
    }

    pub fn first(&self) -> Result<Option<Record>, StorageError> {
        self.iter().next().transpose()
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        self.iter().try_fold(0, |n, r| r.map(|_| n + 1))
    }

    fn selects(&self, record: &Record) -> bool {
        if !self.options.admits(record) {
            return false;
        }
        match &self.selection {
            Selection::Nothing => false,
            Selection::All => true,
            Selection::Key(key) => record.get(&self.key_field) == key,
            Selection::Where { field, value } => record.get(field) == value,
        }
    }
}

/// Iterator over a [`Query`].
pub struct Cursor<'q, 'a, S: ?Sized> {
    query: &'q Query<'a, S>,
    after: Option<Value>,
    buffer: VecDeque<Record>,
    exhausted: bool,
}

impl<S: RecordStore + ?Sized> Iterator for Cursor<'_, '_, S> {
    type Item = Result<Record, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let query = self.query;
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.exhausted {
                return None;
            }

            match &query.selection {
                Selection::Nothing => {
                    self.exhausted = true;
                }
                Selection::Key(key) => {
                    self.exhausted = true;
                    match query.store.get(&query.entity, key) {
                        Ok(Some(record)) if query.selects(&record) => return Some(Ok(record)),
                        Ok(_) => return None,
                        Err(e) => return Some(Err(e)),
                    }
                }
                Selection::All | Selection::Where { .. } => {
                    let page = match query.store.scan_page(
                        &query.entity,
                        self.after.as_ref(),
                        query.page_size,
                    ) {
                        Ok(page) => page,
                        Err(e) => {
                            self.exhausted = true;
                            return Some(Err(e));
                        }
                    };
                    if page.len() < query.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.after = Some(last.get(&query.key_field).clone());
                    }
                    self.buffer
                        .extend(page.into_iter().filter(|r| query.selects(r)));
                }
            }
        }
    }
}
