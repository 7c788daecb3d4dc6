use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::changeset::{decode_entries, ChangeKind, ChangesetEntry, Relation, RowChange, SideEffect};
use super::payload::ChangesetChunk;
use crate::database::{validate_identifier, Database, DbTx, SqlValue};
use crate::errors::{ChangesetError, SyncError};
use crate::voting::{BlockContext, EndBlockHook, ResolutionHandler};

/// What happened to a resolved changeset chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    Stored,
    /// Same `(height, chunk_idx)` was stored before
    Duplicate,
    /// Height is at or below the applied watermark
    Ignored,
}

/// Destination side of the migration: stores voted changeset chunks and
/// replays complete heights in order at the end of each block
pub struct ChangesetApplier {
    db: Database,
    end_height: Option<u64>,
}

impl ChangesetApplier {
    /// `end_height` is the migration end; applying it completes the migration
    pub fn new(db: Database, end_height: Option<u64>) -> Self {
        Self { db, end_height }
    }

    pub async fn accept_chunk(&self, payload: &[u8]) -> Result<ChunkDisposition, ChangesetError> {
        let chunk = ChangesetChunk::decode(payload)?;
        let mut tx = self.db.begin_tx().await?;

        let watermark = tx.applied_watermark().await?;
        if let Some(applied) = watermark {
            if chunk.height <= applied {
                debug!(
                    "Ignoring changeset chunk for height {} at or below watermark {}",
                    chunk.height, applied
                );
                tx.rollback().await;
                return Ok(ChunkDisposition::Ignored);
            }
        }

        let linked = match (chunk.previous_height_with_data, watermark) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(prev), Some(applied)) => prev >= applied,
        };
        if !linked {
            tx.rollback().await;
            warn!(
                "Rejecting changeset chunk for height {}: previous height {:?} is behind watermark {:?}",
                chunk.height, chunk.previous_height_with_data, watermark
            );
            return Err(ChangesetError::OutOfOrder {
                height: chunk.height,
                previous: chunk.previous_height_with_data,
                watermark,
            });
        }

        match tx.changeset_metadata(chunk.height).await? {
            None => {
                tx.insert_changeset_metadata(
                    chunk.height,
                    chunk.total_chunks,
                    chunk.previous_height_with_data,
                )
                .await?
            }
            Some(existing)
                if existing.total_chunks != chunk.total_chunks
                    || existing.prev_height != chunk.previous_height_with_data =>
            {
                tx.rollback().await;
                return Err(ChangesetError::decode(format!(
                    "chunk for height {} disagrees with stored metadata ({} chunks after {:?})",
                    chunk.height, existing.total_chunks, existing.prev_height
                )));
            }
            Some(_) => {}
        }

        let inserted = tx
            .insert_changeset_chunk(chunk.height, chunk.chunk_idx, &chunk.payload)
            .await?;
        tx.commit().await?;

        if inserted {
            debug!(
                "Stored changeset chunk {}/{} for height {}",
                chunk.chunk_idx + 1,
                chunk.total_chunks,
                chunk.height
            );
            Ok(ChunkDisposition::Stored)
        } else {
            Ok(ChunkDisposition::Duplicate)
        }
    }

    /// Replays every complete height that links to the watermark, lowest
    /// first. Returns the applied heights.
    #[instrument(skip(self, block), fields(height = block.height))]
    pub async fn apply_ready(&self, block: &mut BlockContext) -> Result<Vec<u64>, ChangesetError> {
        let mut applied = Vec::new();

        loop {
            let mut tx = self.db.begin_tx().await?;
            let Some(pending) = tx.earliest_pending().await? else {
                tx.rollback().await;
                break;
            };
            let watermark = tx.applied_watermark().await?;
            if !pending.is_complete() || pending.prev_height != watermark {
                debug!(
                    "Height {} not ready ({}/{} chunks, previous {:?}, watermark {:?})",
                    pending.height,
                    pending.received,
                    pending.total_chunks,
                    pending.prev_height,
                    watermark
                );
                tx.rollback().await;
                break;
            }

            let data = tx.changeset_chunks(pending.height).await?.concat();
            let entries = decode_entries(&data)?;
            replay_entries(&mut tx, &entries).await?;

            tx.delete_changeset_height(pending.height).await?;
            tx.set_applied_watermark(pending.height).await?;
            tx.commit().await?;

            info!(
                "Applied changeset for height {} ({} entries)",
                pending.height,
                entries.len()
            );
            applied.push(pending.height);

            if Some(pending.height) == self.end_height {
                block.in_migration = false;
                info!("✓ Migration complete at source height {}", pending.height);
            }
        }

        Ok(applied)
    }
}

#[async_trait]
impl ResolutionHandler for ChangesetApplier {
    async fn resolve(&self, payload: &[u8], _block: &mut BlockContext) -> Result<(), SyncError> {
        self.accept_chunk(payload).await?;
        Ok(())
    }
}

#[async_trait]
impl EndBlockHook for ChangesetApplier {
    fn name(&self) -> &str {
        "changeset_applier"
    }

    async fn end_block(&self, block: &mut BlockContext) -> Result<(), SyncError> {
        self.apply_ready(block).await?;
        Ok(())
    }
}

/// Replays entries strictly in stream order within the caller's transaction
pub async fn replay_entries(tx: &mut DbTx, entries: &[ChangesetEntry]) -> Result<(), ChangesetError> {
    let mut relations: Vec<&Relation> = Vec::new();

    for entry in entries {
        match entry {
            ChangesetEntry::Relation(relation) => {
                validate_identifier(&relation.qualified_name())?;
                for column in &relation.columns {
                    validate_identifier(&column.name)?;
                }
                relations.push(relation);
            }
            ChangesetEntry::RowChange(change) => {
                let relation = relations
                    .get(change.relation as usize)
                    .ok_or(ChangesetError::UnknownRelation {
                        index: change.relation,
                    })?;
                replay_row_change(tx, relation, change).await?;
            }
            ChangesetEntry::SideEffect(effect) => replay_side_effect(tx, effect).await?,
        }
    }
    Ok(())
}

async fn replay_row_change(
    tx: &mut DbTx,
    relation: &Relation,
    change: &RowChange,
) -> Result<(), ChangesetError> {
    let table = relation.qualified_name();
    let tuple = |values: &Option<Vec<SqlValue>>, which: &str| -> Result<Vec<SqlValue>, ChangesetError> {
        let values = values.clone().ok_or_else(|| ChangesetError::Replay {
            reason: format!("{:?} on {} is missing its {} tuple", change.kind, table, which),
        })?;
        if values.len() != relation.columns.len() {
            return Err(ChangesetError::Replay {
                reason: format!(
                    "{} tuple for {} has {} values, relation has {} columns",
                    which,
                    table,
                    values.len(),
                    relation.columns.len()
                ),
            });
        }
        Ok(values)
    };

    let mut params = Vec::new();
    let sql = match change.kind {
        ChangeKind::Insert => {
            let new = tuple(&change.new_tuple, "new")?;
            let columns: Vec<&str> = relation.columns.iter().map(|c| c.name.as_str()).collect();
            let values: Vec<String> = new.into_iter().map(|v| placeholder(v, &mut params)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                values.join(", ")
            )
        }
        ChangeKind::Update => {
            let old = tuple(&change.old_tuple, "old")?;
            let new = tuple(&change.new_tuple, "new")?;
            let assignments: Vec<String> = relation
                .columns
                .iter()
                .zip(new)
                .map(|(column, value)| format!("{} = {}", column.name, placeholder(value, &mut params)))
                .collect();
            let filter = match_clause(relation, old, &mut params);
            format!("UPDATE {} SET {} WHERE {}", table, assignments.join(", "), filter)
        }
        ChangeKind::Delete => {
            let old = tuple(&change.old_tuple, "old")?;
            let filter = match_clause(relation, old, &mut params);
            format!("DELETE FROM {} WHERE {}", table, filter)
        }
    };

    let affected = tx.execute(&sql, &params).await.map_err(|e| ChangesetError::Replay {
        reason: e.to_string(),
    })?;
    if affected == 0 {
        return Err(ChangesetError::Replay {
            reason: format!("{:?} on {} matched no rows", change.kind, table),
        });
    }
    Ok(())
}

async fn replay_side_effect(tx: &mut DbTx, effect: &SideEffect) -> Result<(), ChangesetError> {
    validate_identifier(&effect.table)?;
    validate_identifier(&effect.key_column)?;
    validate_identifier(&effect.value_column)?;
    if effect.key.is_null() {
        return Err(ChangesetError::Replay {
            reason: format!("side effect on {} has a null key", effect.table),
        });
    }

    let sql = format!(
        "UPDATE {} SET {col} = {col} + $1 WHERE {} = $2",
        effect.table,
        effect.key_column,
        col = effect.value_column
    );
    let affected = tx
        .execute(&sql, &[SqlValue::Int(effect.delta), effect.key.clone()])
        .await
        .map_err(|e| ChangesetError::Replay {
            reason: e.to_string(),
        })?;
    if affected == 0 {
        return Err(ChangesetError::Replay {
            reason: format!("side effect on {} found no row for its key", effect.table),
        });
    }
    Ok(())
}

/// Nulls are inlined; everything else becomes the next positional parameter
fn placeholder(value: SqlValue, params: &mut Vec<SqlValue>) -> String {
    if value.is_null() {
        return "NULL".to_string();
    }
    params.push(value);
    format!("${}", params.len())
}

fn match_clause(relation: &Relation, old: Vec<SqlValue>, params: &mut Vec<SqlValue>) -> String {
    relation
        .columns
        .iter()
        .zip(old)
        .map(|(column, value)| {
            if value.is_null() {
                format!("{} IS NULL", column.name)
            } else {
                format!("{} = {}", column.name, placeholder(value, params))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::changeset::Column;

    fn relation() -> Relation {
        Relation {
            schema: String::new(),
            table: "users".into(),
            columns: vec![
                Column {
                    name: "id".into(),
                    data_type: "int8".into(),
                },
                Column {
                    name: "name".into(),
                    data_type: "text".into(),
                },
            ],
        }
    }

    #[test]
    fn null_values_become_is_null_filters() {
        let mut params = Vec::new();
        let clause = match_clause(
            &relation(),
            vec![SqlValue::Int(1), SqlValue::Null],
            &mut params,
        );
        assert_eq!(clause, "id = $1 AND name IS NULL");
        assert_eq!(params, vec![SqlValue::Int(1)]);
    }

    #[test]
    fn placeholders_number_only_bound_values() {
        let mut params = vec![SqlValue::Int(9)];
        assert_eq!(placeholder(SqlValue::Null, &mut params), "NULL");
        assert_eq!(placeholder(SqlValue::Text("a".into()), &mut params), "$2");
        assert_eq!(params.len(), 2);
    }
}
