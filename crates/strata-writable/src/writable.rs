//! The mutable top layer of a running instance.
//!
//! A [`WritableLayer`] is bound to one chain through a [`ChainLease`] and
//! records its own changes in the same [`ChangeRecord`] shape immutable
//! layers use. Lower layers are never touched:
//!
//! - writing a path that only exists below first copies it up (fetches its
//!   content) and records the result as `Modified`,
//! - deleting records a whiteout and drops this layer's records beneath it,
//! - committing turns the changes into an immutable layer and rebases the
//!   writable layer, now empty, onto it.
//!
//! Mutations run in three steps: inspect under the lock, do the store work
//! without it, publish under the lock. A record is only inserted in the last
//! step, so an operation that fails or is cancelled midway leaves nothing
//! behind.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strata_layer::{
    descendants_of, ChainLease, ChangeRecord, Entries, EntryMode, FileMeta, LayerChain,
    LayerRegistry,
};
use strata_merge::{Lookup, MergeView, ResolvedEntry, Source};
use strata_store::{ContentStore, StoreResult};
use strata_types::{Digest, LayerPath, TypeError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::{WritableError, WritableResult};
use crate::status::ChangeSummary;

/// Largest file size `write_at` will grow a file to.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// Lifecycle of a writable layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Accepting reads and mutations.
    Open,
    /// A commit is in flight; mutations fail with `ConflictingWrite`.
    Committing,
    /// Released; every operation fails with `InvalidState`.
    Discarded,
}

struct State {
    phase: Phase,
    lease: ChainLease,
    changes: Entries,
    /// Bumped on every commit. A mutation prepared against an older
    /// generation must not be published.
    generation: u64,
}

/// What a mutation saw when it inspected its target.
struct Target {
    current: Option<ResolvedEntry>,
    exists_below: bool,
    generation: u64,
}

impl Target {
    fn record(&self, meta: FileMeta) -> ChangeRecord {
        if self.exists_below {
            ChangeRecord::Modified(meta)
        } else {
            ChangeRecord::Added(meta)
        }
    }
}

/// References taken by an operation in progress. Whatever is still held when
/// the guard drops is released, which is how a failed or cancelled operation
/// rolls back.
struct HeldRefs<'a> {
    store: &'a ContentStore,
    digests: Vec<Digest>,
}

impl<'a> HeldRefs<'a> {
    fn new(store: &'a ContentStore) -> Self {
        Self {
            store,
            digests: Vec::new(),
        }
    }

    fn retain(&mut self, digest: &Digest) -> StoreResult<()> {
        self.store.retain(digest)?;
        self.digests.push(*digest);
        Ok(())
    }

    fn put(&mut self, data: &[u8]) -> StoreResult<Digest> {
        let digest = self.store.put(data)?;
        self.digests.push(digest);
        Ok(digest)
    }

    /// Take responsibility for releasing a reference someone else held.
    fn adopt(&mut self, digest: Option<Digest>) {
        self.digests.extend(digest);
    }

    /// Hand one held reference over to a published record.
    fn hand_over(&mut self, digest: &Digest) {
        if let Some(idx) = self.digests.iter().position(|d| d == digest) {
            self.digests.swap_remove(idx);
        }
    }
}

impl Drop for HeldRefs<'_> {
    fn drop(&mut self) {
        for digest in self.digests.drain(..) {
            if let Err(e) = self.store.release(&digest) {
                warn!(digest = %digest.short_hex(), error = %e, "failed to release reference");
            }
        }
    }
}

/// A mutable change set on top of an immutable chain.
pub struct WritableLayer {
    id: Uuid,
    registry: Arc<LayerRegistry>,
    state: Mutex<State>,
}

impl WritableLayer {
    /// Create a writable layer on top of the chain ending at `base`, or on
    /// an empty chain.
    pub fn new(registry: Arc<LayerRegistry>, base: Option<Digest>) -> WritableResult<Self> {
        let lease = registry.lease(base)?;
        let id = Uuid::now_v7();
        debug!(layer = %id, base = ?base.map(|d| d.short_hex()), "created writable layer");
        Ok(Self {
            id,
            registry,
            state: Mutex::new(State {
                phase: Phase::Open,
                lease,
                changes: Entries::new(),
                generation: 0,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Resolve `path` through this layer and its chain.
    pub fn read(&self, path: &str) -> WritableResult<ResolvedEntry> {
        let path = LayerPath::parse(path)?;
        let state = self.readable()?;
        let view = self.view(&state)?;
        Ok(view.resolve_path(&path)?)
    }

    /// Resolve `path` and fetch its content.
    pub fn read_bytes(&self, path: &str, ctx: &OpContext) -> WritableResult<Vec<u8>> {
        ctx.check()?;
        let path = LayerPath::parse(path)?;
        let store = self.registry.store();
        let mut held = HeldRefs::new(store);

        let content = {
            let state = self.readable()?;
            let entry = self.view(&state)?.resolve_path(&path)?;
            if entry.is_dir() {
                return Err(WritableError::IsADirectory(path));
            }
            let content = entry.meta.content_ref();
            if let Some(content) = &content {
                held.retain(content)?;
            }
            content
        };

        match content {
            Some(content) => Ok(store.get_with_deadline(&content, ctx.deadline())?),
            None => Ok(Vec::new()),
        }
    }

    /// Visible children of `dir`.
    pub fn list_dir(&self, dir: &str) -> WritableResult<BTreeSet<String>> {
        let dir = LayerPath::parse(dir)?;
        let state = self.readable()?;
        Ok(self.view(&state)?.list_dir(&dir)?)
    }

    /// Every visible entry, parents first.
    pub fn export(&self) -> WritableResult<Vec<ResolvedEntry>> {
        let state = self.readable()?;
        Ok(self.view(&state)?.export()?)
    }

    // ---------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------

    /// Replace the content of `path`, creating it if needed.
    pub fn write(&self, path: &str, bytes: &[u8], ctx: &OpContext) -> WritableResult<FileMeta> {
        self.write_with(path, ctx, false, |data| {
            data.clear();
            data.extend_from_slice(bytes);
        })
    }

    /// Overwrite `bytes` at `offset`, zero-filling any gap past the end.
    pub fn write_at(
        &self,
        path: &str,
        offset: u64,
        bytes: &[u8],
        ctx: &OpContext,
    ) -> WritableResult<FileMeta> {
        let end = offset
            .checked_add(bytes.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .and_then(|end| usize::try_from(end).ok());
        let Some((start, end)) = usize::try_from(offset).ok().zip(end) else {
            return Err(WritableError::InvalidOffset {
                path: LayerPath::parse(path)?,
                offset,
            });
        };
        self.write_with(path, ctx, true, |data| {
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(bytes);
        })
    }

    /// Append `bytes`, creating the file if needed.
    pub fn append(&self, path: &str, bytes: &[u8], ctx: &OpContext) -> WritableResult<FileMeta> {
        self.write_with(path, ctx, true, |data| data.extend_from_slice(bytes))
    }

    fn write_with(
        &self,
        path: &str,
        ctx: &OpContext,
        needs_current: bool,
        splice: impl FnOnce(&mut Vec<u8>),
    ) -> WritableResult<FileMeta> {
        ctx.check()?;
        let path = LayerPath::parse(path)?;
        if path.is_root() {
            return Err(WritableError::IsADirectory(path));
        }
        let store = self.registry.store();
        let mut held = HeldRefs::new(store);

        let target = {
            let state = self.mutable()?;
            let target = self.inspect(&state, &path)?;
            if let Some(entry) = &target.current {
                if entry.is_dir() {
                    return Err(WritableError::IsADirectory(path));
                }
                if let Some(content) = entry.meta.content_ref() {
                    held.retain(&content)?;
                }
            }
            target
        };

        let copy_up = target
            .current
            .as_ref()
            .is_some_and(|entry| entry.source != Source::Writable);
        let mut data = match target.current.as_ref().and_then(|e| e.meta.content_ref()) {
            Some(content) if copy_up || needs_current => {
                ctx.check()?;
                store.get_with_deadline(&content, ctx.deadline())?
            }
            _ => Vec::new(),
        };
        if copy_up {
            debug!(layer = %self.id, path = %path, "copied up");
        }

        ctx.check()?;
        splice(&mut data);
        let content = held.put(&data)?;
        ctx.check()?;

        let mode = target
            .current
            .as_ref()
            .map_or(EntryMode::Regular, |entry| entry.meta.mode);
        let meta = FileMeta::file(content, data.len() as u64).with_mode(mode);
        let previous = {
            let mut state = self.mutable()?;
            if state.generation != target.generation {
                return Err(WritableError::ConflictingWrite(self.id));
            }
            held.hand_over(&content);
            state.changes.insert(path.clone(), target.record(meta.clone()))
        };
        held.adopt(previous.and_then(|r| r.content_ref()));

        debug!(layer = %self.id, path = %path, size = meta.size, content = %content.short_hex(), "wrote file");
        Ok(meta)
    }

    /// Change the mode of a file, copying its metadata up if it lives below.
    pub fn set_mode(&self, path: &str, mode: EntryMode, ctx: &OpContext) -> WritableResult<()> {
        ctx.check()?;
        let path = LayerPath::parse(path)?;
        if mode.is_dir() {
            return Err(WritableError::IsADirectory(path));
        }
        let store = self.registry.store();
        let mut held = HeldRefs::new(store);

        let mut state = self.mutable()?;
        let target = self.inspect(&state, &path)?;
        let Some(entry) = target.current.as_ref() else {
            return Err(WritableError::NotFound(path));
        };
        if entry.is_dir() {
            return Err(WritableError::IsADirectory(path));
        }
        if let Some(content) = entry.meta.content_ref() {
            held.retain(&content)?;
            held.hand_over(&content);
        }
        let meta = FileMeta::file(entry.meta.content, entry.meta.size).with_mode(mode);
        let previous = state.changes.insert(path.clone(), target.record(meta));
        drop(state);
        held.adopt(previous.and_then(|r| r.content_ref()));

        debug!(layer = %self.id, path = %path, mode = %mode, "changed mode");
        Ok(())
    }

    /// Create a directory. Succeeds without change if one is already visible.
    pub fn mkdir(&self, path: &str, ctx: &OpContext) -> WritableResult<()> {
        ctx.check()?;
        let path = LayerPath::parse(path)?;
        if path.is_root() {
            return Ok(());
        }

        let mut state = self.mutable()?;
        let target = self.inspect(&state, &path)?;
        match &target.current {
            Some(entry) if entry.is_dir() => return Ok(()),
            Some(_) => return Err(WritableError::AlreadyExists(path)),
            None => {}
        }

        // Recreating a directory over this layer's own whiteout must keep the
        // old contents hidden.
        if matches!(state.changes.get(path.as_str()), Some(ChangeRecord::Deleted)) {
            let below = MergeView::new(&self.registry, state.lease.chain(), None)?;
            for name in below.list_dir(&path)? {
                let child = path.join(&name)?;
                state.changes.entry(child).or_insert(ChangeRecord::Deleted);
            }
        }
        state
            .changes
            .insert(path.clone(), target.record(FileMeta::directory()));
        drop(state);

        debug!(layer = %self.id, path = %path, "created directory");
        Ok(())
    }

    /// Whiteout `path` and everything beneath it. Idempotent; succeeds
    /// whether or not the path exists.
    pub fn delete(&self, path: &str, ctx: &OpContext) -> WritableResult<()> {
        ctx.check()?;
        let path = LayerPath::parse(path)?;
        if path.is_root() {
            return Err(TypeError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the root".into(),
            }
            .into());
        }
        let mut held = HeldRefs::new(self.registry.store());

        let mut state = self.mutable()?;
        let beneath: Vec<LayerPath> = descendants_of(&state.changes, &path)
            .map(|(p, _)| p.clone())
            .collect();
        for child in &beneath {
            if let Some(record) = state.changes.remove(child) {
                held.adopt(record.content_ref());
            }
        }
        if let Some(previous) = state.changes.insert(path.clone(), ChangeRecord::Deleted) {
            held.adopt(previous.content_ref());
        }
        drop(state);

        debug!(layer = %self.id, path = %path, dropped = beneath.len(), "recorded whiteout");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Turn the pending changes into an immutable layer on top of the
    /// current tip and rebase onto it.
    ///
    /// The new layer is fully persisted before the tip is swapped. Readers
    /// observe either the old chain with the pending changes or the new
    /// chain with none, never a mix. An empty change set commits to a valid
    /// empty layer.
    pub fn commit(&self, ctx: &OpContext) -> WritableResult<Digest> {
        ctx.check()?;
        let (base, entries) = {
            let mut state = self.lock();
            match state.phase {
                Phase::Open => {}
                Phase::Committing => return Err(WritableError::ConflictingWrite(self.id)),
                Phase::Discarded => return Err(self.discarded()),
            }
            state.phase = Phase::Committing;
            (state.lease.tip(), state.changes.clone())
        };

        let outcome = ctx.check().and_then(|()| {
            self.registry
                .register_leased(base, entries)
                .map_err(WritableError::from)
        });

        let mut state = self.lock();
        state.phase = Phase::Open;
        match outcome {
            Ok((digest, lease)) => {
                let previous = std::mem::replace(&mut state.lease, lease);
                let count = state.changes.len();
                // The new layer owns the content references now.
                state.changes.clear();
                state.generation += 1;
                drop(state);
                drop(previous);
                info!(layer = %self.id, tip = %digest.short_hex(), entries = count, "committed writable layer");
                Ok(digest)
            }
            Err(e) => {
                drop(state);
                warn!(layer = %self.id, error = %e, "commit failed, changes kept");
                Err(e)
            }
        }
    }

    /// Release every content reference and the chain lease. The layer is
    /// unusable afterwards.
    pub fn discard(&self) -> WritableResult<()> {
        let (changes, lease) = {
            let mut state = self.lock();
            match state.phase {
                Phase::Open => {}
                Phase::Committing => return Err(WritableError::ConflictingWrite(self.id)),
                Phase::Discarded => return Err(self.discarded()),
            }
            state.phase = Phase::Discarded;
            (
                std::mem::take(&mut state.changes),
                std::mem::replace(&mut state.lease, self.registry.empty_lease()),
            )
        };

        let mut held = HeldRefs::new(self.registry.store());
        for record in changes.values() {
            held.adopt(record.content_ref());
        }
        drop(held);
        drop(lease);
        info!(layer = %self.id, entries = changes.len(), "discarded writable layer");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    /// Tip of the chain this layer sits on.
    pub fn base(&self) -> Option<Digest> {
        self.lock().lease.tip()
    }

    pub fn chain(&self) -> LayerChain {
        self.lock().lease.chain().clone()
    }

    /// A copy of the pending change records.
    pub fn changes(&self) -> Entries {
        self.lock().changes.clone()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary::from_entries(&self.lock().changes)
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn view<'s>(&self, state: &'s State) -> WritableResult<MergeView<'s>> {
        Ok(MergeView::new(
            &self.registry,
            state.lease.chain(),
            Some(&state.changes),
        )?)
    }

    /// Check the ancestors of `path` and resolve it, both through this layer
    /// and through the chain alone.
    fn inspect(&self, state: &State, path: &LayerPath) -> WritableResult<Target> {
        let view = self.view(state)?;
        for ancestor in path.ancestors() {
            let ancestor = LayerPath::parse(ancestor)?;
            if let Lookup::Found(entry) = view.lookup(&ancestor) {
                if !entry.is_dir() {
                    return Err(WritableError::NotADirectory(ancestor));
                }
            }
        }
        let current = match view.lookup(path) {
            Lookup::Found(entry) => Some(entry),
            Lookup::Whiteout | Lookup::Absent => None,
        };
        let below = MergeView::new(&self.registry, state.lease.chain(), None)?;
        Ok(Target {
            current,
            exists_below: below.lookup(path).is_found(),
            generation: state.generation,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn readable(&self) -> WritableResult<MutexGuard<'_, State>> {
        let state = self.lock();
        if state.phase == Phase::Discarded {
            return Err(self.discarded());
        }
        Ok(state)
    }

    fn mutable(&self) -> WritableResult<MutexGuard<'_, State>> {
        let state = self.lock();
        match state.phase {
            Phase::Open => Ok(state),
            Phase::Committing => Err(WritableError::ConflictingWrite(self.id)),
            Phase::Discarded => Err(self.discarded()),
        }
    }

    fn discarded(&self) -> WritableError {
        WritableError::InvalidState {
            id: self.id,
            state: "discarded",
        }
    }
}

impl Drop for WritableLayer {
    fn drop(&mut self) {
        let open = self.lock().phase == Phase::Open;
        if open {
            if let Err(e) = self.discard() {
                warn!(layer = %self.id, error = %e, "failed to discard writable layer on drop");
            }
        }
    }
}

impl std::fmt::Debug for WritableLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WritableLayer")
            .field("id", &self.id)
            .field("phase", &state.phase)
            .field("base", &state.lease.tip())
            .field("changes", &state.changes.len())
            .finish()
    }
}
