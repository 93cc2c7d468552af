//! Definición de packs: referencia versionada y manifiesto.
//!
//! Un pack describe tablas y migraciones ordenadas que su instalación
//! aprovisiona dentro de un esquema aislado. El manifiesto se persiste como
//! JSONB en el catálogo (`packs.manifest`) y debe deserializar de forma
//! estable.

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Referencia versionada, forma `nombre@version` (p. ej. `core.domain@v1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRef {
    pub name: String,
    pub version: String,
}

impl PackRef {
    /// Parsea `core.domain@v1`. La versión es obligatoria.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let mut parts = raw.splitn(2, '@');
        let name = parts.next().unwrap_or("").trim();
        let version = parts.next().unwrap_or("").trim();
        if name.is_empty() || version.is_empty() {
            return Err(DomainError::ValidationError(format!("pack_ref debe ser nombre@version: {raw:?}")));
        }
        Ok(Self { name: name.to_string(),
                  version: version.to_string() })
    }
}

impl std::fmt::Display for PackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Tabla declarada por el manifiesto. El DDL se ejecuta citando el nombre
/// validado dentro del esquema del pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub ddl: String,
}

/// Migración con id estable. Las migraciones se aplican en orden de
/// manifiesto, cada una en su propia transacción, avanzando
/// `migration_state` al confirmar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackMigration {
    pub id: String,
    pub description: String,
    pub ddl: String,
}

/// Manifiesto completo de un pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackManifest {
    #[serde(default)]
    pub tables: Vec<TableSpec>,
    #[serde(default)]
    pub migrations: Vec<PackMigration>,
    pub pack_type: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PackManifest {
    /// Migraciones posteriores a `migration_state` en orden de manifiesto.
    /// Con estado `None` devuelve todas.
    pub fn pending_migrations<'a>(&'a self, migration_state: Option<&str>) -> Vec<&'a PackMigration> {
        match migration_state {
            None => self.migrations.iter().collect(),
            Some(applied) => {
                let pos = self.migrations.iter().position(|m| m.id == applied);
                match pos {
                    // Estado desconocido: no aplicar nada a ciegas.
                    None => Vec::new(),
                    Some(i) => self.migrations.iter().skip(i + 1).collect(),
                }
            }
        }
    }
}
