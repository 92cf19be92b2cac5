use num_traits::{One, Unsigned, Zero};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ops::Add;

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sled(#[from] sled::Error),
    #[error("could not (de)serialize stored value: {0}")]
    Bincode(#[from] bincode::Error),
}

pub trait TypedSled {
    fn get_val<T: DeserializeOwned>(&self, key: impl AsRef<[u8]>) -> Result<Option<T>, DbError>;
    fn set_val<T: Serialize>(&self, key: impl AsRef<[u8]>, val: &T) -> Result<(), DbError>;
    fn increment<T>(&self, key: impl AsRef<[u8]>) -> Result<T, DbError>
    where
        T: Add<Output = T> + DeserializeOwned + Serialize + One + Zero + Unsigned;
}

impl TypedSled for sled::Tree {
    fn get_val<T: DeserializeOwned>(&self, key: impl AsRef<[u8]>) -> Result<Option<T>, DbError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_val<T: Serialize>(&self, key: impl AsRef<[u8]>, val: &T) -> Result<(), DbError> {
        let bytes = bincode::serialize(val)?;
        self.insert(key, bytes)?;
        Ok(())
    }

    /// increment the value in the db or insert zero if none has been set
    fn increment<T>(&self, key: impl AsRef<[u8]>) -> Result<T, DbError>
    where
        T: Add<Output = T> + DeserializeOwned + Serialize + One + Zero + Unsigned,
    {
        let key = key.as_ref();
        loop {
            let old = self.get(key)?;
            let new = match &old {
                Some(bytes) => bincode::deserialize::<T>(bytes)? + T::one(),
                None => T::zero(),
            };
            let bytes = bincode::serialize(&new)?;
            // retry if someone else incremented in the meantime
            if self.compare_and_swap(key, old, Some(bytes))?.is_ok() {
                return Ok(new);
            }
        }
    }
}
