// Graph Store - sole authority for invariant-preserving reads/writes
//
// Five tables: entities, clusters, relationships, evidence, queue.
// Invariants enforced here, not by callers:
//   - entity confidence is monotonically non-decreasing for automated writes
//   - entity_type follows the priority ladder manual > cluster > behavioral
//   - relationship writes keep max confidence for the (source, target, type) key
//   - cluster_id must reference an existing cluster row
//   - evidence is append-only, deduplicated by hash
//   - cluster merges are one ordered transaction

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;

use crate::model::{
    normalize_address, Cluster, Entity, EntityPatch, EntityType, Evidence, Layer, NewEvidence,
    NewRelationship, QueueItem, QueueStatus, Relationship, RelationshipType, TypeSource,
    WriteSource,
};

pub struct GraphStore {
    conn: Connection,
}

/// Counts reported by `stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GraphStats {
    pub entities: i64,
    pub identified_entities: i64,
    pub clusters: i64,
    pub largest_cluster: i64,
    pub relationships: i64,
    pub evidence: i64,
    pub queue_by_status: HashMap<String, i64>,
}

/// What `merge_clusters` actually did.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub surviving_id: String,
    pub absorbed: Vec<String>,
    pub entities_moved: usize,
    pub relationships_migrated: usize,
    pub self_edges_removed: usize,
}

impl GraphStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open graph database {:?}", path.as_ref()))?;
        let mut store = GraphStore { conn };
        store.setup()?;
        // Items left `processing` by a crashed run are picked up again.
        store.recover_stale()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = GraphStore { conn };
        store.setup()?;
        Ok(store)
    }

    fn setup(&mut self) -> Result<()> {
        // WAL mode for crash recovery
        self.conn.pragma_update(None, "journal_mode", "WAL")?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                address TEXT PRIMARY KEY,
                identity TEXT,
                entity_type TEXT NOT NULL DEFAULT 'unknown',
                type_source TEXT NOT NULL DEFAULT 'unset',
                confidence REAL NOT NULL DEFAULT 0.0,
                cluster_id TEXT,
                ens_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                name TEXT,
                detection_methods TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL DEFAULT 0.0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS relationships (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                evidence_ref TEXT NOT NULL,
                cluster_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(source, target, relationship_type)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dedup_hash TEXT UNIQUE NOT NULL,
                entity_address TEXT NOT NULL,
                source TEXT NOT NULL,
                claim TEXT NOT NULL,
                confidence REAL NOT NULL,
                url TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                layer TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(address, layer)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entities_cluster ON entities(cluster_id)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_evidence_address ON evidence(entity_address)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_status ON queue(status, layer)",
            [],
        )?;

        Ok(())
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Insert the entity row if absent; returns the stored row either way.
    pub fn ensure_entity(&mut self, address: &str) -> Result<Entity> {
        let tx = self.conn.transaction()?;
        ensure_entity_inner(&tx, address)?;
        let entity = get_entity_inner(&tx, &normalize_address(address))?
            .expect("entity row exists after insert");
        tx.commit()?;
        Ok(entity)
    }

    /// Create-or-update through the invariant guards.
    ///
    /// Automated writes never lower `confidence` and never demote
    /// `entity_type` set by a higher-priority source; both attempts are
    /// ignored (the row keeps its stronger value). Manual writes bypass
    /// the confidence guard and always win the type ladder.
    pub fn upsert_entity(&mut self, patch: &EntityPatch, source: WriteSource) -> Result<Entity> {
        let tx = self.conn.transaction()?;
        upsert_entity_inner(&tx, patch, source)?;
        let entity = get_entity_inner(&tx, &patch.address)?.expect("entity row exists after upsert");
        tx.commit()?;
        Ok(entity)
    }

    /// Assign an entity to a cluster. Rejects dangling cluster references.
    pub fn set_cluster(&mut self, address: &str, cluster_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        set_cluster_inner(&tx, address, cluster_id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_entity(&self, address: &str) -> Result<Option<Entity>> {
        get_entity_inner(&self.conn, &normalize_address(address))
    }

    pub fn entity_exists(&self, address: &str) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE address = ?1",
            params![normalize_address(address)],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Name search for `query --entity`, matching identity and ENS name.
    pub fn find_by_identity(&self, name: &str) -> Result<Vec<Entity>> {
        let pattern = format!("%{}%", name);
        let mut stmt = self.conn.prepare(
            "SELECT address, identity, entity_type, type_source, confidence,
                    cluster_id, ens_name, created_at, updated_at
             FROM entities
             WHERE identity LIKE ?1 OR ens_name LIKE ?1
             ORDER BY confidence DESC",
        )?;
        let rows = stmt
            .query_map(params![pattern], entity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_entities(&self) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT address, identity, entity_type, type_source, confidence,
                    cluster_id, ens_name, created_at, updated_at
             FROM entities ORDER BY address",
        )?;
        let rows = stmt
            .query_map([], entity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // CLUSTERS
    // ========================================================================

    pub fn create_cluster(
        &mut self,
        name: Option<&str>,
        methods: &BTreeSet<String>,
        confidence: f64,
    ) -> Result<Cluster> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let methods_json = serde_json::to_string(methods)?;
        self.conn.execute(
            "INSERT INTO clusters (id, name, detection_methods, confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, methods_json, confidence.clamp(0.0, 1.0), now],
        )?;
        self.get_cluster(&id)?
            .context("cluster row missing after insert")
    }

    /// Union detection methods and keep the max confidence. A detector
    /// re-observing a cluster never weakens it.
    pub fn reinforce_cluster(
        &mut self,
        cluster_id: &str,
        methods: &BTreeSet<String>,
        confidence: f64,
    ) -> Result<Cluster> {
        let existing = self
            .get_cluster(cluster_id)?
            .with_context(|| format!("unknown cluster {}", cluster_id))?;
        let mut merged: BTreeSet<String> = existing.detection_methods.clone();
        merged.extend(methods.iter().cloned());
        let methods_json = serde_json::to_string(&merged)?;
        let confidence = existing.confidence.max(confidence).clamp(0.0, 1.0);
        self.conn.execute(
            "UPDATE clusters SET detection_methods = ?1, confidence = ?2, updated_at = ?3
             WHERE id = ?4",
            params![methods_json, confidence, Utc::now().to_rfc3339(), cluster_id],
        )?;
        self.get_cluster(cluster_id)?
            .context("cluster row missing after update")
    }

    pub fn name_cluster(&mut self, cluster_id: &str, name: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE clusters SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, Utc::now().to_rfc3339(), cluster_id],
        )?;
        if updated == 0 {
            bail!("unknown cluster {}", cluster_id);
        }
        Ok(())
    }

    pub fn get_cluster(&self, id: &str) -> Result<Option<Cluster>> {
        self.conn
            .query_row(
                "SELECT id, name, detection_methods, confidence, created_at, updated_at
                 FROM clusters WHERE id = ?1",
                params![id],
                cluster_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn all_clusters(&self) -> Result<Vec<Cluster>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, detection_methods, confidence, created_at, updated_at
             FROM clusters ORDER BY confidence DESC",
        )?;
        let rows = stmt
            .query_map([], cluster_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cluster_members(&self, cluster_id: &str) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT address, identity, entity_type, type_source, confidence,
                    cluster_id, ens_name, created_at, updated_at
             FROM entities WHERE cluster_id = ?1 ORDER BY address",
        )?;
        let rows = stmt
            .query_map(params![cluster_id], entity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cluster_member_count(&self, cluster_id: &str) -> Result<i64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE cluster_id = ?1",
            params![cluster_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Absorb `absorbed_ids` into `surviving_id` as one transaction:
    /// (a) reassign member entities, (b) migrate relationships tagged with an
    /// absorbed cluster, (c) drop `same_cluster` self-edges left behind,
    /// (d) delete the absorbed cluster rows last. Nothing transiently points
    /// at a deleted cluster.
    pub fn merge_clusters(
        &mut self,
        surviving_id: &str,
        absorbed_ids: &[String],
    ) -> Result<MergeOutcome> {
        let tx = self.conn.transaction()?;

        let survives: i64 = tx.query_row(
            "SELECT COUNT(*) FROM clusters WHERE id = ?1",
            params![surviving_id],
            |row| row.get(0),
        )?;
        if survives == 0 {
            bail!("surviving cluster {} does not exist", surviving_id);
        }

        let now = Utc::now().to_rfc3339();
        let mut entities_moved = 0usize;
        let mut relationships_migrated = 0usize;

        let mut absorbed = Vec::new();
        for id in absorbed_ids {
            if id == surviving_id {
                continue;
            }
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM clusters WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                // Already merged away by an earlier pass; merging is idempotent.
                debug!(cluster = %id, "skipping absorbed cluster that no longer exists");
                continue;
            }
            absorbed.push(id.clone());

            entities_moved += tx.execute(
                "UPDATE entities SET cluster_id = ?1, updated_at = ?2 WHERE cluster_id = ?3",
                params![surviving_id, now, id],
            )?;
            relationships_migrated += tx.execute(
                "UPDATE relationships SET cluster_id = ?1, updated_at = ?2 WHERE cluster_id = ?3",
                params![surviving_id, now, id],
            )?;
        }

        // Edges that collapsed onto a single address once members merged.
        let self_edges_removed = tx.execute(
            "DELETE FROM relationships
             WHERE relationship_type = 'same_cluster' AND source = target",
            [],
        )?;

        for id in &absorbed {
            tx.execute("DELETE FROM clusters WHERE id = ?1", params![id])?;
        }

        tx.commit()?;

        debug!(
            surviving = %surviving_id,
            absorbed = absorbed.len(),
            entities_moved,
            "clusters merged"
        );

        Ok(MergeOutcome {
            surviving_id: surviving_id.to_string(),
            absorbed,
            entities_moved,
            relationships_migrated,
            self_edges_removed,
        })
    }

    // ========================================================================
    // RELATIONSHIPS
    // ========================================================================

    /// Write a relationship under the monotonic-confidence rule: the row is
    /// replaced only when no row exists for the key or the new confidence is
    /// at least the stored one. Returns whether a write occurred.
    pub fn add_relationship(&mut self, rel: &NewRelationship) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let wrote = add_relationship_inner(&tx, rel)?;
        tx.commit()?;
        Ok(wrote)
    }

    pub fn get_relationship(
        &self,
        source: &str,
        target: &str,
        relationship_type: RelationshipType,
    ) -> Result<Option<Relationship>> {
        self.conn
            .query_row(
                "SELECT source, target, relationship_type, confidence, evidence_ref,
                        cluster_id, created_at, updated_at
                 FROM relationships
                 WHERE source = ?1 AND target = ?2 AND relationship_type = ?3",
                params![
                    normalize_address(source),
                    normalize_address(target),
                    relationship_type.as_str()
                ],
                relationship_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Edges touching an address, either direction.
    pub fn relationships_for(&self, address: &str) -> Result<Vec<Relationship>> {
        let addr = normalize_address(address);
        let mut stmt = self.conn.prepare(
            "SELECT source, target, relationship_type, confidence, evidence_ref,
                    cluster_id, created_at, updated_at
             FROM relationships
             WHERE source = ?1 OR target = ?1
             ORDER BY confidence DESC",
        )?;
        let rows = stmt
            .query_map(params![addr], relationship_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_relationships(&self) -> Result<Vec<Relationship>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, target, relationship_type, confidence, evidence_ref,
                    cluster_id, created_at, updated_at
             FROM relationships ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], relationship_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // EVIDENCE
    // ========================================================================

    /// Append evidence and recompute the entity's confidence in the same
    /// transaction. Returns false when the identical observation was already
    /// recorded (dedup hash hit).
    pub fn add_evidence(&mut self, ev: &NewEvidence) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let inserted = add_evidence_inner(&tx, ev)?;
        tx.commit()?;
        Ok(inserted)
    }

    pub fn evidence_for(&self, address: &str) -> Result<Vec<Evidence>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_address, source, claim, confidence, url, created_at
             FROM evidence WHERE entity_address = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![normalize_address(address)], evidence_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Batch evidence fetch: one query for the whole address set, never one
    /// query per entity.
    pub fn get_evidence_for(&self, addresses: &[String]) -> Result<HashMap<String, Vec<Evidence>>> {
        let mut by_address: HashMap<String, Vec<Evidence>> = HashMap::new();
        if addresses.is_empty() {
            return Ok(by_address);
        }
        let normalized: Vec<String> = addresses.iter().map(|a| normalize_address(a)).collect();
        let placeholders = vec!["?"; normalized.len()].join(",");
        let sql = format!(
            "SELECT id, entity_address, source, claim, confidence, url, created_at
             FROM evidence WHERE entity_address IN ({}) ORDER BY entity_address, created_at, id",
            placeholders
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(normalized.iter()), evidence_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        for ev in rows {
            by_address.entry(ev.entity_address.clone()).or_default().push(ev);
        }
        Ok(by_address)
    }

    // ========================================================================
    // QUEUE
    // ========================================================================

    /// Add a work item unless one already exists for (address, layer).
    /// Returns whether a new item was created.
    pub fn enqueue(&mut self, address: &str, layer: Layer) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let created = enqueue_inner(&tx, address, layer)?;
        tx.commit()?;
        Ok(created)
    }

    /// Move up to `limit` pending items of a layer to `processing` and
    /// return them for the caller to work through one by one.
    pub fn claim_batch(&mut self, layer: Layer, limit: usize) -> Result<Vec<QueueItem>> {
        let tx = self.conn.transaction()?;
        let items = {
            let mut stmt = tx.prepare(
                "SELECT address, layer, status, attempts, last_error, updated_at
                 FROM queue
                 WHERE layer = ?1 AND status = 'pending'
                 ORDER BY updated_at, id
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![layer.as_str(), limit as i64], queue_item_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let now = Utc::now().to_rfc3339();
        for item in &items {
            tx.execute(
                "UPDATE queue SET status = 'processing', updated_at = ?1
                 WHERE address = ?2 AND layer = ?3",
                params![now, item.address, layer.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(items)
    }

    pub fn mark_completed(&mut self, address: &str, layer: Layer) -> Result<()> {
        self.conn.execute(
            "UPDATE queue SET status = 'completed', last_error = NULL, updated_at = ?1
             WHERE address = ?2 AND layer = ?3",
            params![
                Utc::now().to_rfc3339(),
                normalize_address(address),
                layer.as_str()
            ],
        )?;
        Ok(())
    }

    pub fn mark_error(&mut self, address: &str, layer: Layer, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE queue SET status = 'error', attempts = attempts + 1,
                    last_error = ?1, updated_at = ?2
             WHERE address = ?3 AND layer = ?4",
            params![
                error,
                Utc::now().to_rfc3339(),
                normalize_address(address),
                layer.as_str()
            ],
        )?;
        Ok(())
    }

    /// Errored items below the attempt cap go back to `pending`.
    pub fn requeue_failed(&mut self, layer: Layer, attempt_cap: u32) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE queue SET status = 'pending', updated_at = ?1
             WHERE layer = ?2 AND status = 'error' AND attempts < ?3",
            params![Utc::now().to_rfc3339(), layer.as_str(), attempt_cap],
        )?;
        Ok(n)
    }

    /// Items that exhausted their attempts; surfaced, never silently retried.
    pub fn permanently_failed(&self, attempt_cap: u32) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT address, layer, status, attempts, last_error, updated_at
             FROM queue WHERE status = 'error' AND attempts >= ?1
             ORDER BY updated_at",
        )?;
        let rows = stmt
            .query_map(params![attempt_cap], queue_item_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Crash recovery: anything left `processing` is treated as `pending`.
    pub fn recover_stale(&mut self) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE queue SET status = 'pending', updated_at = ?1 WHERE status = 'processing'",
            params![Utc::now().to_rfc3339()],
        )?;
        if n > 0 {
            debug!(recovered = n, "reset stale processing queue items");
        }
        Ok(n)
    }

    pub fn queue_items(&self, layer: Option<Layer>) -> Result<Vec<QueueItem>> {
        let rows = match layer {
            Some(layer) => {
                let mut stmt = self.conn.prepare(
                    "SELECT address, layer, status, attempts, last_error, updated_at
                     FROM queue WHERE layer = ?1 ORDER BY updated_at, id",
                )?;
                let rows = stmt
                    .query_map(params![layer.as_str()], queue_item_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT address, layer, status, attempts, last_error, updated_at
                     FROM queue ORDER BY updated_at, id",
                )?;
                let rows = stmt
                    .query_map([], queue_item_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    // ========================================================================
    // BATCHED LAYER WRITE
    // ========================================================================

    /// Apply one address's full layer output as a single transaction so a
    /// crash mid-write never records an entity without its evidence.
    /// Neighbor enqueues skip addresses already present as entities.
    pub fn apply_layer_write(&mut self, write: &LayerWrite) -> Result<LayerWriteOutcome> {
        let tx = self.conn.transaction()?;
        let mut outcome = LayerWriteOutcome::default();

        // Newly discovered neighbors are checked against the entity table
        // before this write creates their rows: an address the graph already
        // holds is never re-queued.
        let mut to_enqueue = Vec::new();
        for (address, layer) in &write.enqueue {
            let addr = normalize_address(address);
            let known: i64 = tx.query_row(
                "SELECT COUNT(*) FROM entities WHERE address = ?1",
                params![addr],
                |row| row.get(0),
            )?;
            if known == 0 {
                to_enqueue.push((addr, *layer));
            }
        }

        ensure_entity_inner(&tx, &write.address)?;
        if let Some(patch) = &write.entity {
            upsert_entity_inner(&tx, patch, write.source)?;
        }
        for rel in &write.relationships {
            ensure_entity_inner(&tx, &rel.source)?;
            ensure_entity_inner(&tx, &rel.target)?;
            if add_relationship_inner(&tx, rel)? {
                outcome.relationships_written += 1;
            }
        }
        for ev in &write.evidence {
            ensure_entity_inner(&tx, &ev.entity_address)?;
            if add_evidence_inner(&tx, ev)? {
                outcome.evidence_written += 1;
            }
        }
        for (addr, layer) in &to_enqueue {
            if enqueue_inner(&tx, addr, *layer)? {
                outcome.enqueued += 1;
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub fn stats(&self) -> Result<GraphStats> {
        let entities: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        let identified_entities: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE identity IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let clusters: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM clusters", [], |row| row.get(0))?;
        let largest_cluster: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(n), 0) FROM
                (SELECT COUNT(*) AS n FROM entities WHERE cluster_id IS NOT NULL
                 GROUP BY cluster_id)",
            [],
            |row| row.get(0),
        )?;
        let relationships: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))?;
        let evidence: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM evidence", [], |row| row.get(0))?;

        let mut queue_by_status = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            queue_by_status.insert(status, count);
        }

        Ok(GraphStats {
            entities,
            identified_entities,
            clusters,
            largest_cluster,
            relationships,
            evidence,
            queue_by_status,
        })
    }
}

/// One address's accumulated layer output, committed atomically.
#[derive(Debug, Clone)]
pub struct LayerWrite {
    pub address: String,
    pub source: WriteSource,
    pub entity: Option<EntityPatch>,
    pub relationships: Vec<NewRelationship>,
    pub evidence: Vec<NewEvidence>,
    pub enqueue: Vec<(String, Layer)>,
}

impl LayerWrite {
    pub fn new(address: &str) -> Self {
        LayerWrite {
            address: normalize_address(address),
            source: WriteSource::Automated,
            entity: None,
            relationships: Vec::new(),
            evidence: Vec::new(),
            enqueue: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayerWriteOutcome {
    pub relationships_written: usize,
    pub evidence_written: usize,
    pub enqueued: usize,
}

// ============================================================================
// INNER WRITES (shared between single-call methods and apply_layer_write)
// ============================================================================

fn ensure_entity_inner(conn: &Connection, address: &str) -> Result<()> {
    let addr = normalize_address(address);
    if addr.is_empty() {
        bail!("empty address");
    }
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO entities (address, entity_type, type_source, confidence, created_at, updated_at)
         VALUES (?1, 'unknown', 'unset', 0.0, ?2, ?2)",
        params![addr, now],
    )?;
    Ok(())
}

fn upsert_entity_inner(conn: &Connection, patch: &EntityPatch, source: WriteSource) -> Result<()> {
    ensure_entity_inner(conn, &patch.address)?;
    let existing = get_entity_inner(conn, &patch.address)?.expect("row ensured above");
    let now = Utc::now().to_rfc3339();

    if let Some(confidence) = patch.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            bail!(
                "confidence {} out of range for {}",
                confidence,
                patch.address
            );
        }
        let next = if source.is_manual() {
            confidence
        } else if confidence < existing.confidence {
            // Monotonic guard: automated sources never downgrade.
            debug!(
                address = %patch.address,
                held = existing.confidence,
                offered = confidence,
                "ignoring confidence downgrade from automated source"
            );
            existing.confidence
        } else {
            confidence
        };
        conn.execute(
            "UPDATE entities SET confidence = ?1, updated_at = ?2 WHERE address = ?3",
            params![next, now, patch.address],
        )?;
    }

    if let Some(identity) = &patch.identity {
        conn.execute(
            "UPDATE entities SET identity = ?1, updated_at = ?2 WHERE address = ?3",
            params![identity, now, patch.address],
        )?;
    }

    if let Some(entity_type) = patch.entity_type {
        let incoming = if source.is_manual() {
            TypeSource::Manual
        } else {
            patch.type_source
        };
        if incoming >= existing.type_source {
            conn.execute(
                "UPDATE entities SET entity_type = ?1, type_source = ?2, updated_at = ?3
                 WHERE address = ?4",
                params![entity_type.as_str(), incoming.as_str(), now, patch.address],
            )?;
        } else {
            debug!(
                address = %patch.address,
                held = existing.type_source.as_str(),
                offered = incoming.as_str(),
                "ignoring entity_type from lower-priority source"
            );
        }
    }

    if let Some(ens) = &patch.ens_name {
        conn.execute(
            "UPDATE entities SET ens_name = ?1, updated_at = ?2 WHERE address = ?3",
            params![ens, now, patch.address],
        )?;
    }

    Ok(())
}

fn set_cluster_inner(conn: &Connection, address: &str, cluster_id: &str) -> Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM clusters WHERE id = ?1",
        params![cluster_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        bail!("cluster_id {} does not reference an existing cluster", cluster_id);
    }
    ensure_entity_inner(conn, address)?;
    conn.execute(
        "UPDATE entities SET cluster_id = ?1, updated_at = ?2 WHERE address = ?3",
        params![cluster_id, Utc::now().to_rfc3339(), normalize_address(address)],
    )?;
    Ok(())
}

fn add_relationship_inner(conn: &Connection, rel: &NewRelationship) -> Result<bool> {
    if !(0.0..=1.0).contains(&rel.confidence) {
        bail!(
            "confidence {} out of range for {} -> {}",
            rel.confidence,
            rel.source,
            rel.target
        );
    }
    if rel.source == rel.target {
        bail!("self relationship for {}", rel.source);
    }

    let existing: Option<f64> = conn
        .query_row(
            "SELECT confidence FROM relationships
             WHERE source = ?1 AND target = ?2 AND relationship_type = ?3",
            params![rel.source, rel.target, rel.relationship_type.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    let now = Utc::now().to_rfc3339();
    match existing {
        None => {
            conn.execute(
                "INSERT INTO relationships
                    (source, target, relationship_type, confidence, evidence_ref,
                     cluster_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    rel.source,
                    rel.target,
                    rel.relationship_type.as_str(),
                    rel.confidence,
                    rel.evidence_ref,
                    rel.cluster_id,
                    now
                ],
            )?;
            Ok(true)
        }
        Some(held) if rel.confidence >= held => {
            // Full replace, not additive: the stronger observation wins the row.
            conn.execute(
                "UPDATE relationships
                 SET confidence = ?1, evidence_ref = ?2, cluster_id = ?3, updated_at = ?4
                 WHERE source = ?5 AND target = ?6 AND relationship_type = ?7",
                params![
                    rel.confidence,
                    rel.evidence_ref,
                    rel.cluster_id,
                    now,
                    rel.source,
                    rel.target,
                    rel.relationship_type.as_str()
                ],
            )?;
            Ok(true)
        }
        Some(held) => {
            debug!(
                source = %rel.source,
                target = %rel.target,
                kind = rel.relationship_type.as_str(),
                held,
                offered = rel.confidence,
                "keeping higher-confidence relationship"
            );
            Ok(false)
        }
    }
}

fn add_evidence_inner(conn: &Connection, ev: &NewEvidence) -> Result<bool> {
    if !(0.0..=1.0).contains(&ev.confidence) {
        bail!(
            "confidence {} out of range for evidence on {}",
            ev.confidence,
            ev.entity_address
        );
    }
    ensure_entity_inner(conn, &ev.entity_address)?;

    let result = conn.execute(
        "INSERT INTO evidence (dedup_hash, entity_address, source, claim, confidence, url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            ev.dedup_hash(),
            ev.entity_address,
            ev.source,
            ev.claim,
            ev.confidence,
            ev.url,
            Utc::now().to_rfc3339()
        ],
    );

    let inserted = match result {
        Ok(_) => true,
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            false
        }
        Err(e) => return Err(e.into()),
    };

    // Entity confidence derives from evidence: maximum per source category,
    // then the maximum of those maxima. Many weak behavioral observations
    // never outweigh one strong clustering signal.
    let derived: f64 = conn.query_row(
        "SELECT COALESCE(MAX(source_max), 0.0) FROM
            (SELECT MAX(confidence) AS source_max FROM evidence
             WHERE entity_address = ?1 GROUP BY source)",
        params![ev.entity_address],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE entities SET confidence = MAX(confidence, ?1), updated_at = ?2
         WHERE address = ?3",
        params![derived, Utc::now().to_rfc3339(), ev.entity_address],
    )?;

    Ok(inserted)
}

fn enqueue_inner(conn: &Connection, address: &str, layer: Layer) -> Result<bool> {
    let addr = normalize_address(address);
    if addr.is_empty() {
        bail!("empty address");
    }
    let n = conn.execute(
        "INSERT OR IGNORE INTO queue (address, layer, status, attempts, updated_at)
         VALUES (?1, ?2, 'pending', 0, ?3)",
        params![addr, layer.as_str(), Utc::now().to_rfc3339()],
    )?;
    Ok(n > 0)
}

fn get_entity_inner(conn: &Connection, address: &str) -> Result<Option<Entity>> {
    conn.query_row(
        "SELECT address, identity, entity_type, type_source, confidence,
                cluster_id, ens_name, created_at, updated_at
         FROM entities WHERE address = ?1",
        params![address],
        entity_from_row,
    )
    .optional()
    .map_err(Into::into)
}

// ============================================================================
// ROW MAPPERS
// ============================================================================

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn entity_from_row(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
    let entity_type: String = row.get(2)?;
    let type_source: String = row.get(3)?;
    Ok(Entity {
        address: row.get(0)?,
        identity: row.get(1)?,
        entity_type: EntityType::parse(&entity_type).unwrap_or(EntityType::Unknown),
        type_source: TypeSource::parse(&type_source).unwrap_or(TypeSource::Unset),
        confidence: row.get(4)?,
        cluster_id: row.get(5)?,
        ens_name: row.get(6)?,
        created_at: parse_ts(row.get(7)?),
        updated_at: parse_ts(row.get(8)?),
    })
}

fn cluster_from_row(row: &rusqlite::Row) -> rusqlite::Result<Cluster> {
    let methods_json: String = row.get(2)?;
    Ok(Cluster {
        id: row.get(0)?,
        name: row.get(1)?,
        detection_methods: serde_json::from_str(&methods_json).unwrap_or_default(),
        confidence: row.get(3)?,
        created_at: parse_ts(row.get(4)?),
        updated_at: parse_ts(row.get(5)?),
    })
}

fn relationship_from_row(row: &rusqlite::Row) -> rusqlite::Result<Relationship> {
    let kind: String = row.get(2)?;
    Ok(Relationship {
        source: row.get(0)?,
        target: row.get(1)?,
        relationship_type: RelationshipType::parse(&kind)
            .unwrap_or(RelationshipType::CounterpartyOverlap),
        confidence: row.get(3)?,
        evidence_ref: row.get(4)?,
        cluster_id: row.get(5)?,
        created_at: parse_ts(row.get(6)?),
        updated_at: parse_ts(row.get(7)?),
    })
}

fn evidence_from_row(row: &rusqlite::Row) -> rusqlite::Result<Evidence> {
    Ok(Evidence {
        id: row.get(0)?,
        entity_address: row.get(1)?,
        source: row.get(2)?,
        claim: row.get(3)?,
        confidence: row.get(4)?,
        url: row.get(5)?,
        created_at: parse_ts(row.get(6)?),
    })
}

fn queue_item_from_row(row: &rusqlite::Row) -> rusqlite::Result<QueueItem> {
    let layer: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(QueueItem {
        address: row.get(0)?,
        layer: Layer::parse(&layer).unwrap_or(Layer::Expansion),
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Pending),
        attempts: row.get(3)?,
        last_error: row.get(4)?,
        updated_at: parse_ts(row.get(5)?),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GraphStore {
        GraphStore::in_memory().unwrap()
    }

    fn rel(source: &str, target: &str, confidence: f64) -> NewRelationship {
        NewRelationship::new(
            source,
            target,
            RelationshipType::FundedBy,
            confidence,
            "test",
        )
    }

    #[test]
    fn test_relationship_confidence_keeps_max() {
        let mut store = store();

        assert!(store.add_relationship(&rel("0xA", "0xB", 0.9)).unwrap());
        // Lower-confidence detector must not overwrite.
        assert!(!store.add_relationship(&rel("0xA", "0xB", 0.4)).unwrap());
        let held = store
            .get_relationship("0xA", "0xB", RelationshipType::FundedBy)
            .unwrap()
            .unwrap();
        assert_eq!(held.confidence, 0.9);

        // Higher confidence replaces the row entirely.
        let mut stronger = rel("0xA", "0xB", 0.95);
        stronger.evidence_ref = "stronger".to_string();
        assert!(store.add_relationship(&stronger).unwrap());
        let held = store
            .get_relationship("0xA", "0xB", RelationshipType::FundedBy)
            .unwrap()
            .unwrap();
        assert_eq!(held.confidence, 0.95);
        assert_eq!(held.evidence_ref, "stronger");
    }

    #[test]
    fn test_relationship_write_order_independent() {
        // For writes c1 then c2, the stored confidence is max(c1, c2).
        for (c1, c2) in [(0.3, 0.8), (0.8, 0.3), (0.5, 0.5)] {
            let mut store = store();
            store.add_relationship(&rel("0xA", "0xB", c1)).unwrap();
            store.add_relationship(&rel("0xA", "0xB", c2)).unwrap();
            let held = store
                .get_relationship("0xA", "0xB", RelationshipType::FundedBy)
                .unwrap()
                .unwrap();
            assert_eq!(held.confidence, c1.max(c2));
        }
    }

    #[test]
    fn test_entity_confidence_monotonic_for_automated() {
        let mut store = store();
        let mut patch = EntityPatch::new("0xA");
        patch.confidence = Some(0.8);
        store.upsert_entity(&patch, WriteSource::Automated).unwrap();

        patch.confidence = Some(0.2);
        let entity = store.upsert_entity(&patch, WriteSource::Automated).unwrap();
        assert_eq!(entity.confidence, 0.8, "automated downgrade must be ignored");

        // Manual evidence may override regardless of score.
        let entity = store.upsert_entity(&patch, WriteSource::Manual).unwrap();
        assert_eq!(entity.confidence, 0.2);
    }

    #[test]
    fn test_entity_type_priority_ladder() {
        let mut store = store();
        let mut patch = EntityPatch::new("0xA");
        patch.entity_type = Some(EntityType::Fund);
        patch.type_source = TypeSource::Cluster;
        store.upsert_entity(&patch, WriteSource::Automated).unwrap();

        // Behavioral must not overwrite cluster-derived typing.
        patch.entity_type = Some(EntityType::Bot);
        patch.type_source = TypeSource::Behavioral;
        let entity = store.upsert_entity(&patch, WriteSource::Automated).unwrap();
        assert_eq!(entity.entity_type, EntityType::Fund);

        // Manual wins over everything.
        patch.entity_type = Some(EntityType::Individual);
        let entity = store.upsert_entity(&patch, WriteSource::Manual).unwrap();
        assert_eq!(entity.entity_type, EntityType::Individual);
        assert_eq!(entity.type_source, TypeSource::Manual);
    }

    #[test]
    fn test_dangling_cluster_rejected() {
        let mut store = store();
        store.ensure_entity("0xA").unwrap();
        let err = store.set_cluster("0xA", "no-such-cluster");
        assert!(err.is_err(), "dangling cluster_id must be rejected");
    }

    #[test]
    fn test_evidence_max_by_source() {
        let mut store = store();
        store
            .add_evidence(&NewEvidence::new("0xA", "cio", "joint funding pattern", 0.90))
            .unwrap();
        for i in 0..100 {
            store
                .add_evidence(&NewEvidence::new(
                    "0xA",
                    "behavioral",
                    &format!("weak observation {}", i),
                    0.10,
                ))
                .unwrap();
        }
        let entity = store.get_entity("0xA").unwrap().unwrap();
        assert!(
            (entity.confidence - 0.90).abs() < 1e-9,
            "expected max-by-source 0.90, got {}",
            entity.confidence
        );
    }

    #[test]
    fn test_evidence_append_only_dedup() {
        let mut store = store();
        let ev = NewEvidence::new("0xA", "osint", "ENS reverse record", 0.9);
        assert!(store.add_evidence(&ev).unwrap());
        assert!(!store.add_evidence(&ev).unwrap(), "identical claim dedups");
        assert_eq!(store.evidence_for("0xA").unwrap().len(), 1);
    }

    #[test]
    fn test_merge_clusters_leaves_no_absorbed_refs() {
        let mut store = store();
        let methods: BTreeSet<String> = ["circular_funding".to_string()].into_iter().collect();
        let a = store.create_cluster(None, &methods, 0.9).unwrap();
        let b = store.create_cluster(None, &methods, 0.6).unwrap();

        for addr in ["0x1", "0x2"] {
            store.ensure_entity(addr).unwrap();
            store.set_cluster(addr, &a.id).unwrap();
        }
        for addr in ["0x3", "0x4"] {
            store.ensure_entity(addr).unwrap();
            store.set_cluster(addr, &b.id).unwrap();
        }
        let mut tagged = NewRelationship::new(
            "0x3",
            "0x4",
            RelationshipType::SameCluster,
            0.8,
            "cluster b internal",
        );
        tagged.cluster_id = Some(b.id.clone());
        store.add_relationship(&tagged).unwrap();

        let outcome = store.merge_clusters(&a.id, &[b.id.clone()]).unwrap();
        assert_eq!(outcome.entities_moved, 2);
        assert_eq!(outcome.relationships_migrated, 1);

        assert!(store.get_cluster(&b.id).unwrap().is_none());
        for e in store.all_entities().unwrap() {
            assert_ne!(e.cluster_id.as_deref(), Some(b.id.as_str()));
        }
        for r in store.all_relationships().unwrap() {
            assert_ne!(r.cluster_id.as_deref(), Some(b.id.as_str()));
        }
        assert_eq!(store.cluster_member_count(&a.id).unwrap(), 4);
    }

    #[test]
    fn test_merge_clusters_idempotent() {
        let mut store = store();
        let methods: BTreeSet<String> = ["shared_deposit".to_string()].into_iter().collect();
        let a = store.create_cluster(None, &methods, 0.9).unwrap();
        let b = store.create_cluster(None, &methods, 0.5).unwrap();
        store.ensure_entity("0x1").unwrap();
        store.set_cluster("0x1", &b.id).unwrap();

        store.merge_clusters(&a.id, &[b.id.clone()]).unwrap();
        // Second merge of the same pair is a no-op.
        let outcome = store.merge_clusters(&a.id, &[b.id.clone()]).unwrap();
        assert!(outcome.absorbed.is_empty());
        assert_eq!(outcome.entities_moved, 0);
    }

    #[test]
    fn test_queue_state_machine() {
        let mut store = store();
        assert!(store.enqueue("0xA", Layer::Expansion).unwrap());
        assert!(!store.enqueue("0xA", Layer::Expansion).unwrap(), "unique per (address, layer)");

        let claimed = store.claim_batch(Layer::Expansion, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        let items = store.queue_items(Some(Layer::Expansion)).unwrap();
        assert_eq!(items[0].status, QueueStatus::Processing);

        store.mark_error("0xA", Layer::Expansion, "rate limited").unwrap();
        let items = store.queue_items(Some(Layer::Expansion)).unwrap();
        assert_eq!(items[0].status, QueueStatus::Error);
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[0].last_error.as_deref(), Some("rate limited"));

        // Below the cap the item is retried; at the cap it is surfaced.
        assert_eq!(store.requeue_failed(Layer::Expansion, 3).unwrap(), 1);
        store.claim_batch(Layer::Expansion, 10).unwrap();
        store.mark_error("0xA", Layer::Expansion, "rate limited").unwrap();
        store.mark_error("0xA", Layer::Expansion, "rate limited").unwrap();
        assert_eq!(store.requeue_failed(Layer::Expansion, 3).unwrap(), 0);
        let failed = store.permanently_failed(3).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].address, "0xa");
    }

    #[test]
    fn test_recover_stale_processing() {
        let mut store = store();
        store.enqueue("0xA", Layer::Expansion).unwrap();
        store.claim_batch(Layer::Expansion, 10).unwrap();
        // Simulated crash: item stuck in processing.
        let recovered = store.recover_stale().unwrap();
        assert_eq!(recovered, 1);
        let items = store.queue_items(Some(Layer::Expansion)).unwrap();
        assert_eq!(items[0].status, QueueStatus::Pending);
    }

    #[test]
    fn test_get_evidence_for_is_batched() {
        let mut store = store();
        store
            .add_evidence(&NewEvidence::new("0xA", "osint", "claim a", 0.5))
            .unwrap();
        store
            .add_evidence(&NewEvidence::new("0xB", "osint", "claim b", 0.6))
            .unwrap();
        store
            .add_evidence(&NewEvidence::new("0xB", "chain", "claim c", 0.7))
            .unwrap();

        let map = store
            .get_evidence_for(&["0xA".to_string(), "0xB".to_string(), "0xC".to_string()])
            .unwrap();
        assert_eq!(map.get("0xa").map(Vec::len), Some(1));
        assert_eq!(map.get("0xb").map(Vec::len), Some(2));
        assert!(map.get("0xc").is_none());
    }

    #[test]
    fn test_apply_layer_write_skips_known_neighbors() {
        let mut store = store();
        store.ensure_entity("0xKNOWN").unwrap();

        let mut write = LayerWrite::new("0xA");
        write
            .relationships
            .push(rel("0xA", "0xB", 0.7));
        write
            .evidence
            .push(NewEvidence::new("0xA", "chain", "funded by 0xb", 0.7));
        write.enqueue.push(("0xKNOWN".to_string(), Layer::Expansion));
        write.enqueue.push(("0xNEW".to_string(), Layer::Expansion));

        let outcome = store.apply_layer_write(&write).unwrap();
        assert_eq!(outcome.relationships_written, 1);
        assert_eq!(outcome.evidence_written, 1);
        assert_eq!(outcome.enqueued, 1, "known entity must not be re-queued");
    }
}
