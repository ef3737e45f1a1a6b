use sled::Db;

use crate::error::SyncResult;

const SELECTED_TICKER_KEY: &str = "prefs::selected_ticker";

/// Durable user preferences. Only the selected trading pair is kept across restarts.
pub struct SledDb {
    db: Db,
}

impl SledDb {
    pub fn new(path: &str) -> SyncResult<Self> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// In-memory database, discarded on drop
    pub fn temporary() -> SyncResult<Self> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    pub fn insert_str(&self, key: &str, value: &str) -> SyncResult<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.db.get(key) {
            Ok(Some(value)) => String::from_utf8(value.to_vec()).unwrap_or_else(|_| default.to_string()),
            _ => default.to_string(),
        }
    }

    pub fn selected_ticker(&self, default: &str) -> String {
        self.get_str(SELECTED_TICKER_KEY, default)
    }

    pub fn save_selected_ticker(&self, ticker: &str) -> SyncResult<()> {
        self.insert_str(SELECTED_TICKER_KEY, ticker)
    }
}
