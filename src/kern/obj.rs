//! Kernel object id space
//!
//! One contiguous id space covers every wait-queue-backed object. The
//! reserved queues occupy the low ids; per-kind ranges follow, with bases
//! computed once from the resolved configuration, so mapping an id to its
//! kind is a range probe over a handful of entries instead of a tagged
//! union per object.

use crate::config::KernelConfig;
use crate::kern::sched::{Kernel, WQ_FIXED};
use crate::types::{Error, ObjectId, ThreadId};

/// Kind of a kernel object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Mutex,
    Cond,
    Semaphore,
    Event,
    Flag,
    Gate,
    Join,
}

impl ObjectKind {
    /// Object kind name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Mutex => "mutex",
            ObjectKind::Cond => "cond",
            ObjectKind::Semaphore => "sem",
            ObjectKind::Event => "event",
            ObjectKind::Flag => "flag",
            ObjectKind::Gate => "gate",
            ObjectKind::Join => "join",
        }
    }
}

/// Per-kind base indexes into the wait-queue list.
#[derive(Debug, Clone, Copy)]
pub struct ObjectMap {
    pub(crate) mutex_base: usize,
    pub(crate) cond_base: usize,
    pub(crate) sem_base: usize,
    pub(crate) event_base: usize,
    pub(crate) flag_base: usize,
    pub(crate) gate_base: usize,
    pub(crate) join_base: usize,
    pub(crate) total: usize,
    counts: [usize; 7],
}

impl ObjectMap {
    /// Lay out the id space for a configuration.
    pub fn new(cfg: &KernelConfig) -> Self {
        let mutex_base = WQ_FIXED;
        let cond_base = mutex_base + cfg.mutexes;
        let sem_base = cond_base + cfg.conds;
        let event_base = sem_base + cfg.semaphores;
        let flag_base = event_base + cfg.events;
        let gate_base = flag_base + cfg.flags;
        let join_base = gate_base + cfg.gates;
        let total = join_base + cfg.threads;
        ObjectMap {
            mutex_base,
            cond_base,
            sem_base,
            event_base,
            flag_base,
            gate_base,
            join_base,
            total,
            counts: [
                cfg.mutexes,
                cfg.conds,
                cfg.semaphores,
                cfg.events,
                cfg.flags,
                cfg.gates,
                cfg.threads,
            ],
        }
    }

    /// Map an object id to its kind and index within the kind, in O(1).
    pub fn kind(&self, oid: ObjectId) -> Option<(ObjectKind, usize)> {
        let id = oid.index();
        let table = [
            (ObjectKind::Mutex, self.mutex_base, self.counts[0]),
            (ObjectKind::Cond, self.cond_base, self.counts[1]),
            (ObjectKind::Semaphore, self.sem_base, self.counts[2]),
            (ObjectKind::Event, self.event_base, self.counts[3]),
            (ObjectKind::Flag, self.flag_base, self.counts[4]),
            (ObjectKind::Gate, self.gate_base, self.counts[5]),
            (ObjectKind::Join, self.join_base, self.counts[6]),
        ];
        for (kind, base, count) in table {
            if id >= base && id < base + count {
                return Some((kind, id - base));
            }
        }
        None
    }

    /// Wait-queue index of the join queue for a thread slot.
    pub fn join_wq(&self, th: ThreadId) -> usize {
        self.join_base + th.index()
    }
}

// ============================================================================
// Allocation bitmaps
// ============================================================================

/// Allocate the lowest free bit of a bitmap bounded by `count`.
pub(crate) fn bmp_alloc_lo(bmp: &mut u32, count: usize) -> Option<usize> {
    let free = !*bmp & ((1u64 << count) - 1) as u32;
    if free == 0 {
        return None;
    }
    let idx = free.trailing_zeros() as usize;
    *bmp |= 1 << idx;
    Some(idx)
}

/// Allocate the highest free bit of a bitmap bounded by `count`.
pub(crate) fn bmp_alloc_hi(bmp: &mut u32, count: usize) -> Option<usize> {
    let free = !*bmp & ((1u64 << count) - 1) as u32;
    if free == 0 {
        return None;
    }
    let idx = 31 - free.leading_zeros() as usize;
    *bmp |= 1 << idx;
    Some(idx)
}

impl Kernel {
    fn kind_state(&mut self, kind: ObjectKind) -> (&mut u32, usize, usize) {
        match kind {
            ObjectKind::Mutex => (&mut self.mutex_alloc, self.cfg.mutexes, self.map.mutex_base),
            ObjectKind::Cond => (&mut self.cond_alloc, self.cfg.conds, self.map.cond_base),
            ObjectKind::Semaphore => (&mut self.sem_alloc, self.cfg.semaphores, self.map.sem_base),
            ObjectKind::Event => (&mut self.ev_alloc, self.cfg.events, self.map.event_base),
            ObjectKind::Flag => (&mut self.flag_alloc, self.cfg.flags, self.map.flag_base),
            ObjectKind::Gate => (&mut self.gate_alloc, self.cfg.gates, self.map.gate_base),
            // Join slots are allocated with their thread, never directly.
            ObjectKind::Join => (&mut self.th_alloc, 0, self.map.join_base),
        }
    }

    /// Allocate an object of `kind`, initializing its state.
    pub fn obj_alloc(&mut self, kind: ObjectKind) -> Result<ObjectId, Error> {
        let (bmp, count, base) = self.kind_state(kind);
        let idx = bmp_alloc_lo(bmp, count).ok_or(Error::ResourceExhausted)?;
        match kind {
            ObjectKind::Mutex => self.mutex_owner[idx] = None,
            ObjectKind::Semaphore => self.sem_val[idx] = 0,
            ObjectKind::Event => self.ev[idx] = crate::kern::event::EventSet::INIT,
            ObjectKind::Flag => self.flag_bits &= !(1 << idx),
            ObjectKind::Gate => self.gate_bits &= !(1 << idx),
            ObjectKind::Cond | ObjectKind::Join => {}
        }
        Ok(ObjectId((base + idx) as u16))
    }

    /// Free an object. Threads still blocked on it are released with a
    /// `Canceled` result rather than left dangling.
    pub fn obj_free(&mut self, oid: ObjectId) -> Result<(), Error> {
        let (kind, idx) = self.map.kind(oid).ok_or(Error::InvalidObjectId)?;
        if kind == ObjectKind::Join {
            return Err(Error::InvalidObjectId);
        }
        let (bmp, _, _) = self.kind_state(kind);
        if *bmp & (1 << idx) == 0 {
            return Err(Error::InvalidObjectId);
        }
        *bmp &= !(1 << idx);
        let released = self.wake_all(oid.index(), Error::Canceled.code() as u32);
        if released > 0 {
            self.defer_sched();
        }
        Ok(())
    }

    /// Validate an id against an expected kind, returning the in-kind index.
    pub(crate) fn obj_check(&self, oid: ObjectId, want: ObjectKind) -> Result<usize, Error> {
        let (kind, idx) = self.map.kind(oid).ok_or(Error::InvalidObjectId)?;
        if kind != want {
            return Err(Error::InvalidObjectId);
        }
        let allocated = match kind {
            ObjectKind::Mutex => self.mutex_alloc & (1 << idx) != 0,
            ObjectKind::Cond => self.cond_alloc & (1 << idx) != 0,
            ObjectKind::Semaphore => self.sem_alloc & (1 << idx) != 0,
            ObjectKind::Event => self.ev_alloc & (1 << idx) != 0,
            ObjectKind::Flag => self.flag_alloc & (1 << idx) != 0,
            ObjectKind::Gate => self.gate_alloc & (1 << idx) != 0,
            ObjectKind::Join => self.th_alloc & (1 << idx) != 0,
        };
        if !allocated {
            return Err(Error::InvalidObjectId);
        }
        Ok(idx)
    }

    /// Kind of an object id, for introspection.
    pub fn obj_kind(&self, oid: ObjectId) -> Option<ObjectKind> {
        self.map.kind(oid).map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    #[test]
    fn id_ranges_are_contiguous_and_disjoint() {
        let cfg = KernelConfig::default();
        let map = ObjectMap::new(&cfg);

        assert_eq!(map.kind(ObjectId(map.mutex_base as u16)), Some((ObjectKind::Mutex, 0)));
        assert_eq!(
            map.kind(ObjectId((map.cond_base - 1) as u16)),
            Some((ObjectKind::Mutex, cfg.mutexes - 1))
        );
        assert_eq!(map.kind(ObjectId(map.sem_base as u16)), Some((ObjectKind::Semaphore, 0)));
        assert_eq!(map.kind(ObjectId(map.total as u16)), None);
        // Reserved queues are not objects.
        assert_eq!(map.kind(ObjectId(0)), None);
    }

    #[test]
    fn alloc_scans_low_and_reports_exhaustion() {
        let mut bmp = 0u32;
        assert_eq!(bmp_alloc_lo(&mut bmp, 2), Some(0));
        assert_eq!(bmp_alloc_lo(&mut bmp, 2), Some(1));
        assert_eq!(bmp_alloc_lo(&mut bmp, 2), None);
    }

    #[test]
    fn alloc_hi_scans_from_the_top() {
        let mut bmp = 0u32;
        assert_eq!(bmp_alloc_hi(&mut bmp, 8), Some(7));
        assert_eq!(bmp_alloc_hi(&mut bmp, 8), Some(6));
        bmp |= 0x3f;
        assert_eq!(bmp_alloc_hi(&mut bmp, 8), None);
    }

    #[test]
    fn object_alloc_free_round_trip() {
        let mut k = Kernel::new(KernelConfig::default());
        let m = k.obj_alloc(ObjectKind::Mutex).unwrap();
        assert_eq!(k.obj_kind(m), Some(ObjectKind::Mutex));
        assert!(k.obj_check(m, ObjectKind::Mutex).is_ok());
        assert_eq!(k.obj_check(m, ObjectKind::Semaphore), Err(Error::InvalidObjectId));

        k.obj_free(m).unwrap();
        assert_eq!(k.obj_check(m, ObjectKind::Mutex), Err(Error::InvalidObjectId));
    }

    #[test]
    fn exhausting_a_kind_reports_resource_exhausted() {
        let cfg = KernelConfig {
            gates: 2,
            ..Default::default()
        };
        let mut k = Kernel::new(cfg);
        k.obj_alloc(ObjectKind::Gate).unwrap();
        k.obj_alloc(ObjectKind::Gate).unwrap();
        assert_eq!(k.obj_alloc(ObjectKind::Gate), Err(Error::ResourceExhausted));
    }
}
