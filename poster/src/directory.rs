//! The fixed table of poster records inside a node's region.
//!
//! Records are allocated once, when the node is formatted, and never freed. A deleted poster only
//! marks its record free and bumps its generation. That keeps each record's lock at a stable
//! offset, so a process still waiting on the lock of a deleted poster never touches freed memory.
use poster_arena::Region;

use crate::lock::{TicketLock, LOCK_SIZE};
use crate::op::Endianness;
use crate::PosterDate;

/// Longest poster name in bytes.
pub const MAX_NAME: usize = 64;

pub(crate) const RECORD_SIZE: u64 = 192;

const R_STATE: u64 = 0;
const R_GENERATION: u64 = 4;
const R_SIZE: u64 = 8;
const R_DATA: u64 = 16;
const R_PID: u64 = 24;
const R_ENDIAN: u64 = 28;
const R_FRESH: u64 = 32;
const R_NANOS: u64 = 36;
const R_SECS: u64 = 40;
const R_NAME_LEN: u64 = 48;
const R_NAME: u64 = 56;
const R_LOCK: u64 = 128;

const STATE_FREE: u32 = 0;
const STATE_LIVE: u32 = 1;

#[derive(Clone, Copy)]
pub(crate) struct Directory<'r> {
    region: &'r Region,
    table: u64,
    capacity: u32,
}

/// A view of one record.
#[derive(Clone, Copy)]
pub(crate) struct Record<'r> {
    region: &'r Region,
    at: u64,
}

impl<'r> Directory<'r> {
    pub(crate) fn new(region: &'r Region, table: u64, capacity: u32) -> Self {
        assert!(region.contains(table, u64::from(capacity) * RECORD_SIZE));
        Directory {
            region,
            table,
            capacity,
        }
    }

    pub(crate) fn table_size(capacity: u32) -> u64 {
        u64::from(capacity) * RECORD_SIZE
    }

    /// Mark every record free. Only valid before the node is shared.
    pub(crate) fn init(&self) {
        self.region
            .fill(self.table, Self::table_size(self.capacity), 0);
        for slot in self.records() {
            slot.lock().init();
        }
    }

    pub(crate) fn record(&self, slot: u32) -> Record<'r> {
        assert!(slot < self.capacity, "record {slot} out of range");
        Record {
            region: self.region,
            at: self.table + u64::from(slot) * RECORD_SIZE,
        }
    }

    fn records(&self) -> impl Iterator<Item = Record<'r>> + 'r {
        let this = *self;
        (0..self.capacity).map(move |slot| this.record(slot))
    }

    /// Find a live record by name. The caller holds the node lock.
    pub(crate) fn find(&self, name: &str) -> Option<u32> {
        (0..self.capacity).find(|&slot| {
            let record = self.record(slot);
            record.is_live() && record.name_matches(name)
        })
    }

    /// Claim a free record. The caller holds the node lock.
    pub(crate) fn claim(&self) -> Option<u32> {
        (0..self.capacity).find(|&slot| !self.record(slot).is_live())
    }

    /// Number of live records.
    pub(crate) fn live(&self) -> usize {
        self.records().filter(Record::is_live).count()
    }
}

impl<'r> Record<'r> {
    pub(crate) fn lock(&self) -> TicketLock<'r> {
        TicketLock::new(self.region, self.at + R_LOCK)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.region.load_u32(self.at + R_STATE) == STATE_LIVE
    }

    pub(crate) fn generation(&self) -> u32 {
        self.region.load_u32(self.at + R_GENERATION)
    }

    /// Whether the record still holds the poster of `generation`.
    pub(crate) fn holds(&self, generation: u32) -> bool {
        self.is_live() && self.generation() == generation
    }

    pub(crate) fn size(&self) -> u64 {
        self.region.load_u64(self.at + R_SIZE)
    }

    pub(crate) fn data(&self) -> u64 {
        self.region.load_u64(self.at + R_DATA)
    }

    pub(crate) fn set_buffer(&self, data: u64, size: u64) {
        self.region.store_u64(self.at + R_DATA, data);
        self.region.store_u64(self.at + R_SIZE, size);
    }

    pub(crate) fn creator(&self) -> u32 {
        self.region.load_u32(self.at + R_PID)
    }

    pub(crate) fn endianness(&self) -> Endianness {
        Endianness::from_code(self.region.load_u32(self.at + R_ENDIAN))
            .unwrap_or(Endianness::native())
    }

    pub(crate) fn is_fresh(&self) -> bool {
        self.region.load_u32(self.at + R_FRESH) != 0
    }

    pub(crate) fn date(&self) -> PosterDate {
        PosterDate {
            secs: self.region.load_u64(self.at + R_SECS),
            nanos: self.region.load_u32(self.at + R_NANOS),
        }
    }

    /// Record a completed write.
    pub(crate) fn touch(&self, date: PosterDate) {
        self.region.store_u64(self.at + R_SECS, date.secs);
        self.region.store_u32(self.at + R_NANOS, date.nanos);
        self.region.store_u32(self.at + R_FRESH, 1);
    }

    pub(crate) fn name(&self) -> String {
        let len = (self.region.load_u32(self.at + R_NAME_LEN) as usize).min(MAX_NAME);
        let mut buf = vec![0; len];
        self.region.copy_out(self.at + R_NAME, &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn name_matches(&self, name: &str) -> bool {
        let len = self.region.load_u32(self.at + R_NAME_LEN) as usize;
        if len != name.len() || len > MAX_NAME {
            return false;
        }

        let mut buf = [0; MAX_NAME];
        self.region.copy_out(self.at + R_NAME, &mut buf[..len]);
        buf[..len] == *name.as_bytes()
    }

    /// Make a free record live. The caller holds the node lock and checked the name length.
    pub(crate) fn open(&self, name: &str, data: u64, size: u64, pid: u32, order: Endianness) {
        debug_assert!(name.len() <= MAX_NAME);
        self.set_buffer(data, size);
        self.region.store_u32(self.at + R_PID, pid);
        self.region.store_u32(self.at + R_ENDIAN, order.code());
        self.region.store_u32(self.at + R_FRESH, 0);
        self.region.store_u64(self.at + R_SECS, 0);
        self.region.store_u32(self.at + R_NANOS, 0);
        self.region.fill(self.at + R_NAME, MAX_NAME as u64, 0);
        self.region.copy_in(self.at + R_NAME, name.as_bytes());
        self.region
            .store_u32(self.at + R_NAME_LEN, name.len() as u32);
        self.region.store_u32(self.at + R_STATE, STATE_LIVE);
    }

    /// Retire the record, invalidating all handles to its poster.
    pub(crate) fn close(&self) {
        self.region.store_u32(self.at + R_STATE, STATE_FREE);
        let generation = self.generation().wrapping_add(1);
        self.region.store_u32(self.at + R_GENERATION, generation);
        self.set_buffer(0, 0);
        self.region.store_u32(self.at + R_NAME_LEN, 0);
    }
}

const _: () = assert!(R_NAME + MAX_NAME as u64 <= R_LOCK);
const _: () = assert!(R_LOCK + LOCK_SIZE == RECORD_SIZE);

#[test]
fn reuse_bumps_generation() {
    let region = Region::anonymous(4096).unwrap();
    let directory = Directory::new(&region, 0, 4);
    directory.init();

    let slot = directory.claim().unwrap();
    let record = directory.record(slot);
    record.open("speed", 1024, 8, 42, Endianness::Big);
    let generation = record.generation();
    assert_eq!(directory.find("speed"), Some(slot));
    assert_eq!(directory.find("spee"), None);
    assert_eq!(record.name(), "speed");
    assert_eq!(record.endianness(), Endianness::Big);
    assert!(!record.is_fresh());

    record.close();
    assert!(!record.holds(generation));
    assert_eq!(directory.find("speed"), None);
    assert_eq!(directory.live(), 0);
    assert_eq!(directory.claim(), Some(slot));
}
