//! Artifacts inmutables direccionados por contenido.
//!
//! El contenido vive en un árbol de dos niveles
//! `sha256[0..2]/sha256[2..4]/sha256`; la fila registra hash, largo y
//! content-type. La deduplicación la garantiza el índice único parcial
//! sobre `sha256`.

use diesel::prelude::*;
use log::debug;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;
use xyn_core::errors::CoreError;
use xyn_core::model::{ArtifactRecord, EmitEvent, NewArtifact};
use xyn_core::store::ArtifactStore;
use xyn_domain::events as event_names;

use crate::error::PersistenceError;
use crate::schema::artifacts;

use super::{core_err, insert_event_tx, with_retry, ConnectionProvider};

#[derive(Queryable, QueryableByName, Debug, Clone)]
#[diesel(table_name = artifacts)]
pub struct ArtifactRow {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub content_type: String,
    pub byte_length: i64,
    pub sha256: Option<String>,
    pub storage_path: Option<String>,
    pub created_by: Option<String>,
    pub run_id: Option<Uuid>,
    pub step_id: Option<Uuid>,
    pub metadata: Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ArtifactRow {
    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord { id: self.id,
                         name: self.name,
                         kind: self.kind,
                         content_type: self.content_type,
                         byte_length: self.byte_length,
                         sha256: self.sha256,
                         storage_path: self.storage_path,
                         created_by: self.created_by,
                         run_id: self.run_id,
                         step_id: self.step_id,
                         metadata: self.metadata,
                         created_at: self.created_at }
    }
}

#[derive(Insertable)]
#[diesel(table_name = artifacts)]
struct NewArtifactRow {
    name: String,
    kind: String,
    content_type: String,
    byte_length: i64,
    sha256: Option<String>,
    storage_path: Option<String>,
    created_by: Option<String>,
    run_id: Option<Uuid>,
    step_id: Option<Uuid>,
    metadata: Value,
}

pub struct PgArtifactStore<P: ConnectionProvider> {
    provider: P,
    root: PathBuf,
}

impl<P: ConnectionProvider> PgArtifactStore<P> {
    pub fn new(provider: P, root: PathBuf) -> Self {
        Self { provider, root }
    }

    fn relative_path(sha: &str) -> String {
        format!("{}/{}/{}", &sha[..2], &sha[2..4], sha)
    }

    fn write_content(&self, sha: &str, bytes: &[u8]) -> Result<String, PersistenceError> {
        let rel = Self::relative_path(sha);
        let full = self.root.join(&rel);
        if full.exists() {
            return Ok(rel);
        }
        if let Some(dir) = full.parent() {
            fs::create_dir_all(dir).map_err(|e| PersistenceError::Unavailable(format!("mkdir artifacts: {e}")))?;
        }
        fs::write(&full, bytes).map_err(|e| PersistenceError::Unavailable(format!("write artifact: {e}")))?;
        Ok(rel)
    }

    fn find_by_sha(conn: &mut PgConnection, sha: &str) -> Result<Option<ArtifactRow>, PersistenceError> {
        artifacts::table.filter(artifacts::sha256.eq(sha))
                        .first::<ArtifactRow>(conn)
                        .optional()
                        .map_err(PersistenceError::from)
    }
}

impl<P: ConnectionProvider> ArtifactStore for PgArtifactStore<P> {
    fn put(&self, artifact: NewArtifact) -> Result<ArtifactRecord, CoreError> {
        let sha = hex::encode(Sha256::digest(&artifact.bytes));
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      if let Some(existing) = Self::find_by_sha(&mut conn, &sha)? {
                          debug!("artifact dedup por sha {sha}");
                          return Ok(existing);
                      }
                      let rel = self.write_content(&sha, &artifact.bytes)?;
                      let inserted = conn.build_transaction().read_write().run(|tx| {
                                            let row: ArtifactRow = diesel::insert_into(artifacts::table)
                                                .values(&NewArtifactRow { name: artifact.name.clone(),
                                                                          kind: artifact.kind.clone(),
                                                                          content_type: artifact.content_type.clone(),
                                                                          byte_length: artifact.bytes.len() as i64,
                                                                          sha256: Some(sha.clone()),
                                                                          storage_path: Some(rel.clone()),
                                                                          created_by: artifact.created_by.clone(),
                                                                          run_id: artifact.run_id,
                                                                          step_id: artifact.step_id,
                                                                          metadata: artifact.metadata.clone() })
                                                .get_result(tx)
                                                .map_err(PersistenceError::from)?;
                                            let correlation = artifact.run_id.unwrap_or(row.id);
                                            insert_event_tx(tx,
                                                            EmitEvent { event_name:
                                                                            event_names::ARTIFACT_ATTACHED.to_string(),
                                                                        data: json!({"sha256": sha,
                                                                                     "byte_length": row.byte_length}),
                                                                        correlation_id: correlation,
                                                                        run_id: artifact.run_id,
                                                                        step_id: artifact.step_id,
                                                                        actor: artifact.created_by.clone(),
                                                                        resource_kind: Some("artifact".to_string()),
                                                                        resource_id: Some(row.id.to_string()) })?;
                                            Ok(row)
                                        });
                      match inserted {
                          // Carrera con otro writer del mismo contenido.
                          Err(PersistenceError::Duplicate(_)) => {
                              Self::find_by_sha(&mut conn, &sha)?
                                  .ok_or_else(|| PersistenceError::Other("artifact desaparecido tras conflicto".into()))
                          }
                          other => other,
                      }
                  }).map_err(core_err)?;
        Ok(row.into_record())
    }

    fn get(&self, id: Uuid) -> Result<Option<ArtifactRecord>, CoreError> {
        let row = with_retry(|| {
                      let mut conn = self.provider.connection()?;
                      artifacts::table.filter(artifacts::id.eq(id))
                                      .first::<ArtifactRow>(&mut conn)
                                      .optional()
                                      .map_err(PersistenceError::from)
                  }).map_err(core_err)?;
        Ok(row.map(|r| r.into_record()))
    }
}
