use tracing::info;

use crate::db::{DbError, TypedSled};

const NEXT_ID: &str = "next_second_id";

/// Disk nodes file their data for a storage under a secondary id. This maps
/// (first id of a disk node, storage id) to that secondary id, durably.
#[derive(Debug, Clone)]
pub struct ServerIdManager {
    ids: sled::Tree,
    counters: sled::Tree,
}

fn key(first_id: &str, storage_id: u32) -> String {
    format!("{first_id}/{storage_id}")
}

impl ServerIdManager {
    pub fn open(db: &sled::Db) -> Result<Self, DbError> {
        Ok(Self {
            ids: db.open_tree("second_ids")?,
            counters: db.open_tree("second_id_counters")?,
        })
    }

    /// the secondary id disk node `first_id` uses for `storage_id`, if it
    /// has one
    pub fn other_second_id(&self, first_id: &str, storage_id: u32) -> Result<Option<String>, DbError> {
        self.ids.get_val(key(first_id, storage_id))
    }

    pub fn register(&self, first_id: &str, storage_id: u32, second_id: &str) -> Result<(), DbError> {
        self.ids.set_val(key(first_id, storage_id), &second_id.to_owned())
    }

    /// Returns the secondary id of `first_id` for `storage_id`, handing out
    /// a fresh one the first time.
    pub fn second_id(&self, first_id: &str, storage_id: u32) -> Result<String, DbError> {
        if let Some(existing) = self.other_second_id(first_id, storage_id)? {
            return Ok(existing);
        }

        let n: u64 = self.counters.increment(NEXT_ID)?;
        let fresh = format!("2{n}");
        let res = self.ids.compare_and_swap(
            key(first_id, storage_id),
            None::<&[u8]>,
            Some(bincode::serialize(&fresh)?),
        )?;
        match res {
            Ok(()) => {
                info!("assigned secondary id {fresh} to [{first_id}] for storage {storage_id}");
                Ok(fresh)
            }
            // lost a race, use the winner's
            Err(_) => Ok(self
                .other_second_id(first_id, storage_id)?
                .unwrap_or(fresh)),
        }
    }

    pub fn remove(&self, first_id: &str, storage_id: u32) -> Result<bool, DbError> {
        Ok(self.ids.remove(key(first_id, storage_id))?.is_some())
    }
}
