//! Clasificación de errores de la capa Postgres.
//!
//! Diesel entrega los fallos de constraint como `DatabaseError(kind, info)`;
//! aquí se reclasifican según lo que el runtime necesita decidir: ¿la fila
//! ya existía (claim perdido)?, ¿se rechazó un invariante del esquema?,
//! ¿vale la pena reintentar la sentencia? El mapeo final a la taxonomía
//! observable vive en `From<PersistenceError> for CoreError`.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;
use xyn_core::errors::CoreError;

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Índice único o PK ya ocupado: típicamente un claim que perdió la
    /// carrera o un insert idempotente repetido.
    #[error("fila duplicada: {0}")]
    Duplicate(String),

    /// Un CHECK del esquema rechazó la escritura (segunda línea de defensa
    /// de los invariantes de estado).
    #[error("invariante de esquema rechazado: {0}")]
    InvariantRejected(String),

    /// FK hacia una fila que no existe (o ya no existe).
    #[error("referencia rota: {0}")]
    BrokenReference(String),

    #[error("fila inexistente")]
    NotFound,

    /// Deadlock o fallo de serialización: la transacción puede repetirse.
    #[error("conflicto de concurrencia (repetible)")]
    Retryable,

    /// Pool agotado, conexión caída o transaction manager irrecuperable.
    #[error("base de datos no disponible: {0}")]
    Unavailable(String),

    /// Configuración de conexión incompleta o ilegible.
    #[error("configuración de base de datos: {0}")]
    Config(String),

    #[error("error de base no clasificado: {0}")]
    Other(String),
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        use DatabaseErrorKind as Kind;
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(Kind::UniqueViolation, info) => Self::Duplicate(info.message().to_string()),
            DieselError::DatabaseError(Kind::CheckViolation, info) => {
                Self::InvariantRejected(info.message().to_string())
            }
            DieselError::DatabaseError(Kind::ForeignKeyViolation, info) => {
                Self::BrokenReference(info.message().to_string())
            }
            DieselError::DatabaseError(Kind::SerializationFailure, _) => Self::Retryable,
            DieselError::DatabaseError(Kind::ClosedConnection, info) => Self::Unavailable(info.message().to_string()),
            DieselError::DatabaseError(kind, info) => Self::Other(format!("{kind:?}: {}", info.message())),
            DieselError::BrokenTransactionManager => Self::Unavailable("transaction manager irrecuperable".into()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<PersistenceError> for CoreError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound => CoreError::NotFound,
            PersistenceError::Duplicate(m) => CoreError::Conflict(m),
            PersistenceError::InvariantRejected(m) | PersistenceError::BrokenReference(m) => CoreError::Constraint(m),
            PersistenceError::Retryable => CoreError::Transient("conflicto de concurrencia".into()),
            PersistenceError::Unavailable(m) => CoreError::Transient(m),
            PersistenceError::Config(m) | PersistenceError::Other(m) => CoreError::Storage(m),
        }
    }
}
