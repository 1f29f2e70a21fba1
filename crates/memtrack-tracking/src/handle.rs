use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use memtrack_core::{AddressSpace, MemoryBlock, MemoryProtection, Range, Va};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::Shared;

/// A one-shot action run before a trapped access proceeds.
pub type PreAction = Box<dyn FnOnce() + Send>;

/// Pre-actions collected while the tracking lock is held.
pub(crate) type PendingActions = SmallVec<[PreAction; 2]>;

/// Identifier of a tracking handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle state shared between the consumer and the regions observing it.
pub(crate) struct HandleShared {
    id: HandleId,
    address: Va,
    size: u64,
    dirty: AtomicBool,

    /// Pending pre-action.
    ///
    /// Only ever exchanged as a whole, so concurrent faults on the same
    /// handle run the action at most once.
    pre_action: Mutex<Option<PreAction>>,

    /// Aggregate dirty flag of the owning multi-region handle.
    parent: OnceLock<Arc<AtomicBool>>,
}

impl HandleShared {
    pub(crate) fn new(id: HandleId, address: Va, size: u64) -> Self {
        Self {
            id,
            address,
            size,
            dirty: AtomicBool::new(true),
            pre_action: Mutex::new(None),
            parent: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn address(&self) -> Va {
        self.address
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn has_action(&self) -> bool {
        lock(&self.pre_action).is_some()
    }

    pub(crate) fn required_permission(&self) -> MemoryProtection {
        if self.has_action() {
            MemoryProtection::NONE
        } else if self.dirty() {
            MemoryProtection::RW
        } else {
            MemoryProtection::R
        }
    }

    pub(crate) fn take_action(&self) -> Option<PreAction> {
        lock(&self.pre_action).take()
    }

    pub(crate) fn replace_action(&self, action: PreAction) -> Option<PreAction> {
        lock(&self.pre_action).replace(action)
    }

    pub(crate) fn set_parent(&self, parent: Arc<AtomicBool>) {
        let result = self.parent.set(parent);
        debug_assert!(result.is_ok(), "handle already belongs to a multi-region handle");
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);

        if let Some(parent) = self.parent.get() {
            parent.store(true, Ordering::Release);
        }
    }

    /// Signals an access while the tracking lock is held.
    ///
    /// The pending action is moved into `actions`, to be run once the lock
    /// has been released.
    pub(crate) fn signal(&self, write: bool, actions: &mut PendingActions) {
        if let Some(action) = self.take_action() {
            actions.push(action);
        }

        if write {
            self.mark_dirty();
        }
    }
}

impl std::fmt::Debug for HandleShared {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HandleShared")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("size", &self.size)
            .field("dirty", &self.dirty())
            .field("has_action", &self.has_action())
            .finish()
    }
}

/// A subscription to accesses within a tracked range.
///
/// The handle starts dirty. A write to the range marks it dirty again after
/// [`reprotect`] cleared it. A pre-action registered with
/// [`register_action`] runs once, before the next read or write proceeds.
///
/// Dropping the handle stops tracking. Regions left without handles are
/// removed and their pages unprotected.
///
/// [`reprotect`]: Self::reprotect
/// [`register_action`]: Self::register_action
pub struct RegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    pub(crate) shared: Arc<HandleShared>,
    pub(crate) tracking: Arc<Shared<Block, Space>>,
}

impl<Block, Space> RegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    /// Returns the identifier of the handle.
    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    /// Checks whether a write was observed since the last [`reprotect`].
    ///
    /// [`reprotect`]: Self::reprotect
    pub fn dirty(&self) -> bool {
        self.shared.dirty()
    }

    /// Returns the protection this handle needs on its range.
    ///
    /// - [`MemoryProtection::NONE`] while a pre-action is pending, so that
    ///   every access traps.
    /// - [`MemoryProtection::RW`] while dirty, nothing needs to trap.
    /// - [`MemoryProtection::R`] otherwise, so that only writes trap.
    pub fn required_permission(&self) -> MemoryProtection {
        self.shared.required_permission()
    }

    /// Signals an access to the range.
    ///
    /// Runs the pending pre-action, if any, and marks the handle dirty on
    /// write. Protection is recomputed afterwards.
    pub fn signal(&self, write: bool) {
        if let Some(action) = self.shared.take_action() {
            action();
        }

        if write {
            self.shared.mark_dirty();
        }

        self.tracking.update_handle_protection(self.shared.id);
    }

    /// Clears the dirty flag and protects the range again, so that the next
    /// write traps.
    pub fn reprotect(&self) {
        self.shared.clear_dirty();
        self.tracking.update_handle_protection(self.shared.id);
    }

    /// Registers an action to run before the next access to the range.
    ///
    /// Replaces a previously registered action that has not run yet. When
    /// no action was pending, the range is protected so that reads trap too.
    pub fn register_action(&self, action: impl FnOnce() + Send + 'static) {
        let previous = self.shared.replace_action(Box::new(action));

        if previous.is_none() {
            self.tracking.update_handle_protection(self.shared.id);
        }
    }

    /// Stops tracking.
    ///
    /// Equivalent to dropping the handle.
    pub fn dispose(self) {
        drop(self);
    }
}

impl<Block, Space> Range for RegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    type Address = Va;

    fn address(&self) -> Va {
        self.shared.address
    }

    fn size(&self) -> u64 {
        self.shared.size
    }
}

impl<Block, Space> Drop for RegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    fn drop(&mut self) {
        self.tracking.remove_handle(self.shared.id);
    }
}

impl<Block, Space> std::fmt::Debug for RegionHandle<Block, Space>
where
    Block: MemoryBlock,
    Space: AddressSpace,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.shared.fmt(f)
    }
}
