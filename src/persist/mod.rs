use std::sync::Arc;

pub mod cleanup;
pub mod lnurl;
pub mod memory;
pub mod nwc;
pub mod postgres;

/// Facade over the per-family stores, passed around by cheap clone.
#[derive(Clone)]
pub struct Store {
    pub lnurl: Arc<dyn lnurl::LnurlStore>,
    pub nwc: Arc<dyn nwc::NwcStore>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            lnurl: Arc::new(memory::MemoryLnurlStore::new()),
            nwc: Arc::new(memory::MemoryNwcStore::new()),
        }
    }

    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            lnurl: Arc::new(postgres::PostgresLnurlStore::new(pool.clone())),
            nwc: Arc::new(postgres::PostgresNwcStore::new(pool)),
        }
    }
}
