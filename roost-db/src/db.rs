use turso::{Builder, Connection, Database};

pub struct RoostDatabase {
    db: Database,
}

impl RoostDatabase {
    /// Open (or create) the local database file and switch it to WAL mode.
    pub async fn open(url: &str) -> anyhow::Result<Self> {
        let db = Builder::new_local(url).build().await?;

        let conn = db.connect().map_err(anyhow::Error::from)?;
        conn.pragma_update("journal_mode", "wal").await?;

        Ok(Self { db })
    }

    pub fn connect(&self) -> anyhow::Result<Connection> {
        self.db.connect().map_err(anyhow::Error::from)
    }
}
