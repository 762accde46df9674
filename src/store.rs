//! Main Store struct tying all components together.

use crate::context::EntityContext;
use crate::error::{Result, StoreError};
use crate::merge::MergePolicyTable;
use crate::present;
use crate::query::{FilterSpec, SortSpec};
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::snapshot::Snapshot;
use crate::subscriptions::{LiveQuery, LiveResultSet, SubscriptionId, SubscriptionManager};
use crate::types::{Entity, EntityId, EntityInput, EntityRef, FieldValue, SaveOutcome, StoreStats};
use crate::wal::WriteAheadLog;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Fold the journal into the snapshot after this many saves. 0 disables
    /// automatic checkpoints.
    pub checkpoint_every: u64,

    /// Change signals buffered per subscriber.
    pub notify_buffer: usize,

    /// Conflict resolution for unique fields on save.
    pub merge_policy: MergePolicyTable,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            create_if_missing: true,
            checkpoint_every: 64,
            notify_buffer: 16,
            merge_policy: MergePolicyTable::default(),
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"LST\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const JOURNAL_FILE: &str = "journal.wal";

/// The entity store.
///
/// Mutations apply to an in-memory context immediately and are visible to
/// reads and live queries right away; `save` makes them durable. Every
/// mutation, the recomputation of live result sets and the resulting
/// notifications happen under one lock, so subscribers only ever observe
/// complete mutations.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Declared entity types.
    schemas: RwLock<SchemaRegistry>,

    /// Live and committed entities. Serializes every mutation.
    context: Mutex<EntityContext>,

    /// Journal of saved batches.
    journal: WriteAheadLog,

    /// Live queries.
    subscriptions: SubscriptionManager,

    merge_policy: RwLock<MergePolicyTable>,

    saves_since_checkpoint: AtomicU64,
}

/// Mutations applied as one atomic step by [`Store::batch`].
pub struct Batch<'a> {
    ctx: &'a mut EntityContext,
    schemas: &'a SchemaRegistry,
}

impl Batch<'_> {
    pub fn insert(&mut self, input: EntityInput) -> Result<EntityRef> {
        self.ctx.insert(self.schemas, input)
    }

    pub fn update(&mut self, id: EntityId, field: &str, value: Option<FieldValue>) -> Result<()> {
        self.ctx.set_field(self.schemas, id, field, value)
    }

    pub fn set_field(&mut self, id: EntityId, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        self.update(id, field, Some(value.into()))
    }

    pub fn clear_field(&mut self, id: EntityId, field: &str) -> Result<()> {
        self.update(id, field, None)
    }

    pub fn delete(&mut self, id: EntityId) -> Result<()> {
        self.ctx.delete(self.schemas, id)
    }

    pub fn link(&mut self, from: EntityId, relationship: &str, to: EntityId) -> Result<()> {
        self.ctx.link(self.schemas, from, relationship, to)
    }

    pub fn unlink(&mut self, from: EntityId, relationship: &str, to: EntityId) -> Result<()> {
        self.ctx.unlink(self.schemas, from, relationship, to)
    }

    /// Read an entity as the batch currently sees it.
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.ctx.get(id)
    }
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(Self::load_failure(&config.path, StoreError::NotInitialized))
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        Self::load(config, true)
    }

    /// Open an existing store.
    ///
    /// Any failure other than lock contention is reported as
    /// [`StoreError::StoreLoadFailure`]; no partially loaded store is returned.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::load(config, false)
    }

    fn load(config: StoreConfig, create: bool) -> Result<Self> {
        let path = config.path.clone();
        Self::load_inner(config, create).map_err(|e| Self::load_failure(&path, e))
    }

    fn load_inner(config: StoreConfig, create: bool) -> Result<Self> {
        if create {
            fs::create_dir_all(&config.path)?;
        } else {
            Self::verify_manifest(&config.path)?;
        }

        // No store file is written before the lock is held
        let lock_file = Self::acquire_lock(&config.path)?;
        if create {
            Self::write_manifest(&config.path)?;
        }

        let snapshot = Snapshot::load(config.path.join(SNAPSHOT_FILE))?.unwrap_or_default();
        let (journal, entries) =
            WriteAheadLog::open(config.path.join(JOURNAL_FILE), snapshot.journal_seq + 1)?;

        let entities = snapshot
            .entities
            .into_iter()
            .map(|entity| (entity.id, entity))
            .collect();
        let mut context = EntityContext::new(entities, snapshot.next_id);

        // Entries at or below the snapshot's sequence are already folded in
        let mut replayed = 0;
        for entry in entries {
            if entry.seq > snapshot.journal_seq {
                context.replay(entry.next_id, entry.mutations);
                replayed += 1;
            }
        }

        info!(
            path = %config.path.display(),
            entities = context.len(),
            replayed,
            created = create,
            "opened store"
        );

        Ok(Self {
            subscriptions: SubscriptionManager::with_buffer_size(config.notify_buffer),
            merge_policy: RwLock::new(config.merge_policy.clone()),
            config,
            _lock_file: lock_file,
            schemas: RwLock::new(SchemaRegistry::new()),
            context: Mutex::new(context),
            journal,
            saves_since_checkpoint: AtomicU64::new(0),
        })
    }

    fn load_failure(path: &Path, err: StoreError) -> StoreError {
        match err {
            StoreError::Locked | StoreError::StoreLoadFailure { .. } => err,
            other => StoreError::StoreLoadFailure {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }

    // --- Schema Operations ---

    /// Declare an entity type.
    ///
    /// Re-registering an identical schema is a no-op; a different schema
    /// under the same name fails with [`StoreError::SchemaExists`].
    pub fn register_schema(&self, schema: EntitySchema) -> Result<()> {
        let name = schema.name.clone();
        self.schemas.write().register(schema)?;
        debug!(entity_type = %name, "registered schema");
        Ok(())
    }

    pub fn schema(&self, entity_type: &str) -> Option<EntitySchema> {
        self.schemas.read().get(entity_type).cloned()
    }

    // --- Mutations ---

    /// Insert a new entity. It is pending until the next `save`.
    pub fn insert(&self, input: EntityInput) -> Result<EntityRef> {
        self.mutate(|ctx, schemas| ctx.insert(schemas, input))
    }

    /// Set (`Some`) or clear (`None`) a field.
    pub fn update(&self, id: EntityId, field: &str, value: Option<FieldValue>) -> Result<()> {
        self.mutate(|ctx, schemas| ctx.set_field(schemas, id, field, value))
    }

    pub fn set_field(&self, id: EntityId, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        self.update(id, field, Some(value.into()))
    }

    pub fn clear_field(&self, id: EntityId, field: &str) -> Result<()> {
        self.update(id, field, None)
    }

    /// Delete an entity, detaching it from every relationship.
    pub fn delete(&self, id: EntityId) -> Result<()> {
        self.mutate(|ctx, schemas| ctx.delete(schemas, id))
    }

    /// Connect `from.relationship` to `to`, keeping the inverse in step.
    pub fn link(&self, from: EntityId, relationship: &str, to: EntityId) -> Result<()> {
        self.mutate(|ctx, schemas| ctx.link(schemas, from, relationship, to))
    }

    pub fn unlink(&self, from: EntityId, relationship: &str, to: EntityId) -> Result<()> {
        self.mutate(|ctx, schemas| ctx.unlink(schemas, from, relationship, to))
    }

    /// Apply several mutations as one step.
    ///
    /// Live queries observe only the final state. If the closure fails,
    /// every mutation it made is rolled back.
    pub fn batch<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Batch<'_>) -> Result<R>,
    {
        self.mutate(|ctx, schemas| f(&mut Batch { ctx, schemas }))
    }

    fn mutate<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&mut EntityContext, &SchemaRegistry) -> Result<R>,
    {
        let mut ctx = self.context.lock();
        let schemas = self.schemas.read();

        ctx.begin();
        match op(&mut *ctx, &*schemas) {
            Ok(value) => {
                ctx.commit_tx();
                self.refresh(&ctx);
                Ok(value)
            }
            Err(e) => {
                ctx.rollback();
                Err(e)
            }
        }
    }

    /// Re-derive every live result set. Caller holds the context lock.
    fn refresh(&self, ctx: &EntityContext) -> usize {
        self.subscriptions
            .refresh(|query| query.evaluate(ctx.of_type(&query.entity_type)))
    }

    // --- Save / Discard ---

    pub fn has_changes(&self) -> bool {
        self.context.lock().has_changes()
    }

    /// Commit pending changes to the journal.
    ///
    /// With nothing pending this returns [`SaveOutcome::NoChanges`] without
    /// touching disk. Unique-field conflicts are resolved by the merge
    /// policy first; a rejected conflict or a failed write leaves every
    /// change pending.
    pub fn save(&self) -> Result<SaveOutcome> {
        let mut ctx = self.context.lock();
        if !ctx.has_changes() {
            return Ok(SaveOutcome::NoChanges);
        }

        let schemas = self.schemas.read();
        let policies = self.merge_policy.read().clone();

        ctx.begin();
        let merged = match ctx.resolve_conflicts(&schemas, &policies) {
            Ok(merged) => merged,
            Err(e) => {
                ctx.rollback();
                return Err(e);
            }
        };

        let mutations = ctx.pending_mutations();
        if mutations.is_empty() {
            // Touched, but nothing differs from the committed state
            ctx.commit_tx();
            ctx.mark_saved();
            return Ok(SaveOutcome::NoChanges);
        }

        let changes = mutations.len();
        let seq = match self.journal.append(ctx.next_id(), mutations) {
            Ok(seq) => seq,
            Err(e) => {
                ctx.rollback();
                return Err(StoreError::Persist(e.to_string()));
            }
        };

        ctx.commit_tx();
        ctx.mark_saved();
        if merged > 0 {
            self.refresh(&ctx);
        }
        debug!(seq, changes, merged, "saved");

        let every = self.config.checkpoint_every;
        if every > 0 && self.saves_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1 >= every {
            // The save itself is durable; a failed checkpoint only delays folding
            if let Err(e) = self.checkpoint_locked(&ctx) {
                warn!(error = %e, "checkpoint failed");
            }
        }

        Ok(SaveOutcome::Committed { changes, merged })
    }

    /// Drop pending changes and restore the committed state.
    pub fn discard_changes(&self) -> bool {
        let mut ctx = self.context.lock();
        let discarded = ctx.discard();
        if discarded {
            self.refresh(&ctx);
            debug!("discarded pending changes");
        }
        discarded
    }

    pub fn set_merge_policy(&self, policy: impl Into<MergePolicyTable>) {
        *self.merge_policy.write() = policy.into();
    }

    /// Fold the journal into a fresh snapshot of the committed state.
    pub fn checkpoint(&self) -> Result<()> {
        let ctx = self.context.lock();
        self.checkpoint_locked(&ctx)
    }

    fn checkpoint_locked(&self, ctx: &EntityContext) -> Result<()> {
        let snapshot = Snapshot {
            journal_seq: self.journal.last_seq(),
            next_id: ctx.next_id(),
            entities: ctx.committed_entities(),
        };
        snapshot.write(self.config.path.join(SNAPSHOT_FILE))?;
        self.journal.clear()?;
        self.saves_since_checkpoint.store(0, Ordering::SeqCst);

        info!(
            journal_seq = snapshot.journal_seq,
            entities = snapshot.entities.len(),
            "checkpoint written"
        );
        Ok(())
    }

    // --- Reads ---

    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.context.lock().get(id).cloned()
    }

    /// Every live entity of a type, in insertion order.
    pub fn entities_of(&self, entity_type: &str) -> Vec<Entity> {
        self.context.lock().of_type(entity_type).cloned().collect()
    }

    /// One-off query without a subscription.
    pub fn fetch(&self, entity_type: &str, filter: Option<&FilterSpec>, sort: &SortSpec) -> Vec<Entity> {
        let query = LiveQuery::new(entity_type, filter.cloned(), sort.clone());
        let ctx = self.context.lock();
        query.evaluate(ctx.of_type(entity_type))
    }

    /// Members of a to-many relationship, sorted. Ties keep the order in
    /// which children were added.
    pub fn children(&self, parent: EntityId, relationship: &str, sort: &SortSpec) -> Result<Vec<Entity>> {
        let ctx = self.context.lock();
        let entity = ctx.get(parent).ok_or(StoreError::EntityNotFound(parent))?;
        self.schemas.read().relationship(&entity.entity_type, relationship)?;

        let children: Vec<Entity> = entity
            .children(relationship)
            .filter_map(|id| ctx.get(id).cloned())
            .collect();
        Ok(present::sorted_children(&children, sort))
    }

    // --- Subscriptions ---

    /// Register a live query.
    ///
    /// The entity type, filter key and sort keys are checked against the
    /// declared schema here; any unknown name fails with
    /// [`StoreError::InvalidPredicate`] and nothing is registered.
    pub fn subscribe(
        &self,
        entity_type: &str,
        filter: Option<FilterSpec>,
        sort: SortSpec,
    ) -> Result<LiveResultSet> {
        let ctx = self.context.lock();
        let query = self.validated_query(entity_type, filter, sort)?;
        let initial = query.evaluate(ctx.of_type(entity_type));
        let results = self.subscriptions.register(query, initial);
        debug!(subscription = results.id().0, entity_type, "subscribed");
        Ok(results)
    }

    /// Swap the filter of a live query in one step.
    ///
    /// The result set goes straight from the old filter's results to the
    /// new one's; no state mixes the two.
    pub fn replace_filter(&self, id: SubscriptionId, filter: Option<FilterSpec>) -> Result<()> {
        let ctx = self.context.lock();
        let current = self
            .subscriptions
            .query(id)
            .ok_or(StoreError::SubscriptionNotFound(id))?;
        let query = self.validated_query(&current.entity_type, filter, current.sort)?;
        let results = query.evaluate(ctx.of_type(&query.entity_type));
        self.subscriptions.replace_query(id, query, results)
    }

    /// Tear down a live query. Safe at any time, including while a
    /// subscriber is iterating its results; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    fn validated_query(
        &self,
        entity_type: &str,
        filter: Option<FilterSpec>,
        sort: SortSpec,
    ) -> Result<LiveQuery> {
        let schemas = self.schemas.read();
        let schema = schemas.get(entity_type).ok_or_else(|| {
            StoreError::invalid_predicate(format!("unknown entity type {entity_type:?}"))
        })?;

        let keys = filter
            .as_ref()
            .map(FilterSpec::key)
            .into_iter()
            .chain(sort.keys().iter().map(|k| k.key.as_str()));
        for key in keys {
            if !schema.has_field(key) {
                return Err(StoreError::invalid_predicate(format!(
                    "{entity_type} has no field named {key:?}"
                )));
            }
        }

        Ok(LiveQuery::new(entity_type, filter, sort))
    }

    // --- Utility ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let ctx = self.context.lock();
        let snapshot_size_bytes = fs::metadata(self.config.path.join(SNAPSHOT_FILE))
            .map(|m| m.len())
            .unwrap_or(0);

        StoreStats {
            entity_count: ctx.len() as u64,
            pending_count: ctx.pending_count() as u64,
            schema_count: self.schemas.read().len() as u64,
            subscription_count: self.subscriptions.subscription_count() as u64,
            journal_size_bytes: self.journal.size(),
            snapshot_size_bytes,
        }
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Internal ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join(MANIFEST_FILE);
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join(MANIFEST_FILE);
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join(LOCK_FILE);
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let pending = self.context.get_mut().pending_count();
        if pending > 0 {
            warn!(pending, path = %self.config.path.display(), "store closed with unsaved changes");
        }
    }
}
