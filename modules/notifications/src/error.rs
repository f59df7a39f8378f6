use event_consumer::LedgerError;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
