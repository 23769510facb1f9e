use crate::record::{Mutation, Record};
use indexmap::IndexMap;
use justdb_schema::Value;

#[derive(Debug, Clone)]
enum Staged {
    Put(Record),
    Removed,
}

/// Pending writes of one runtime call, layered over the store. Nothing
/// reaches the store until the whole call succeeds.
#[derive(Debug, Default)]
pub(crate) struct Stage {
    entries: IndexMap<(String, Value), Staged>,
}

impl Stage {
    /// `None`: not staged. `Some(None)`: staged for removal.
    pub(crate) fn get(&self, entity: &str, key: &Value) -> Option<Option<&Record>> {
        self.entries
            .get(&(entity.to_string(), key.clone()))
            .map(|staged| match staged {
                Staged::Put(record) => Some(record),
                Staged::Removed => None,
            })
    }

    pub(crate) fn put(&mut self, key: Value, record: Record) {
        self.entries
            .insert((record.entity.clone(), key), Staged::Put(record));
    }

    pub(crate) fn remove(&mut self, entity: &str, key: Value) {
        self.entries
            .insert((entity.to_string(), key), Staged::Removed);
    }

    /// Mutations for the store. Only records that already exist are ever
    /// staged, so puts become replacements.
    pub(crate) fn into_mutations(self) -> Vec<Mutation> {
        self.entries
            .into_iter()
            .map(|((entity, key), staged)| match staged {
                Staged::Put(record) => Mutation::Replace { key, record },
                Staged::Removed => Mutation::Remove { entity, key },
            })
            .collect()
    }
}
