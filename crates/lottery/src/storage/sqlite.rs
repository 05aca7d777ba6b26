use crate::config::StorageConfig;
use crate::storage::{BetStore, StorageError};
use crate::types::{AgencyId, Bet, BirthDate};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior, params};
use std::path::Path;

type DbPool = Pool<SqliteConnectionManager>;

/// SQLite implementation of the BetStore trait
pub struct SqliteBetStore {
    pool: DbPool,
}

impl SqliteBetStore {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, StorageError> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(5) // Writes are serialized by the coordinator lock
            .min_idle(Some(1))
            .build(manager)?;

        Ok(SqliteBetStore { pool })
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bets (
                id INTEGER PRIMARY KEY,
                agency INTEGER NOT NULL,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                document TEXT NOT NULL,
                birthdate TEXT NOT NULL,
                number INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_bets_agency ON bets(agency);
            "#,
        )
    }
}

struct BetRow {
    id: i64,
    agency: u32,
    first_name: String,
    last_name: String,
    document: String,
    birthdate: String,
    number: u32,
}

impl TryFrom<BetRow> for Bet {
    type Error = StorageError;

    fn try_from(row: BetRow) -> Result<Self, Self::Error> {
        let corrupt = |e: crate::types::BetParseError| StorageError::Corrupt {
            row: row.id,
            reason: e.to_string(),
        };
        Ok(Bet {
            agency: AgencyId::new(row.agency).map_err(corrupt)?,
            birthdate: row.birthdate.parse::<BirthDate>().map_err(corrupt)?,
            first_name: row.first_name,
            last_name: row.last_name,
            document: row.document,
            number: row.number,
        })
    }
}

impl BetStore for SqliteBetStore {
    fn append(&self, bets: &[Bet]) -> Result<(), StorageError> {
        if bets.is_empty() {
            return Ok(());
        }

        let mut conn = self.pool.get()?;
        // Take the write lock up front so busy_timeout covers contention
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Prepare and execute in a scope to drop stmt before commit
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO bets (agency, first_name, last_name, document, birthdate, number)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for bet in bets {
                stmt.execute(params![
                    bet.agency.get(),
                    bet.first_name,
                    bet.last_name,
                    bet.document,
                    bet.birthdate.to_string(),
                    bet.number,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Bet>, StorageError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, agency, first_name, last_name, document, birthdate, number
            FROM bets
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BetRow {
                id: row.get(0)?,
                agency: row.get(1)?,
                first_name: row.get(2)?,
                last_name: row.get(3)?,
                document: row.get(4)?,
                birthdate: row.get(5)?,
                number: row.get(6)?,
            })
        })?;

        let mut bets = Vec::new();
        for row in rows {
            bets.push(Bet::try_from(row?)?);
        }
        Ok(bets)
    }

    fn count(&self) -> Result<u64, StorageError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM bets", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
