//! Per-die job bookkeeping.
//!
//! Every die numbers the jobs it is sent with a 16-bit wrapping sequence.
//! Status reports tell us which core slots are free and the newest sequence
//! the die has taken in; a slot is refilled only once the die has caught up
//! with the job we last sent to that core, otherwise a status that crossed
//! our own hash frame on the wire would make us overwrite fresh work.

use bitvec::prelude::*;
use rand::{seq::SliceRandom, Rng};
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

use crate::asic::gn::{Frame, HashJob, InitAck, MonitorSample, ProtocolError, StatusReport};
use crate::error::{Error, Result};
use crate::pow::TestJob;
use crate::tracing::prelude::*;

/// Half the sequence space. Sequences closer than this compare directly.
pub const SEQUENCE_WINDOW: u16 = 0x8000;

/// Wraparound-aware `a < b` for 16-bit sequence numbers.
///
/// Within half the sequence space the raw values compare directly; farther
/// apart, the counter must have wrapped and the larger raw value is the
/// earlier one.
pub fn seq_lt(a: u16, b: u16) -> bool {
    if a.abs_diff(b) < SEQUENCE_WINDOW {
        a < b
    } else {
        b < a
    }
}

/// Wraparound-aware `a <= b`.
pub fn seq_le(a: u16, b: u16) -> bool {
    a == b || seq_lt(a, b)
}

/// Which of a core's two job slots is being filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Active,
    Pending,
}

/// A job that has been sent to a core and may still produce nonces.
#[derive(Debug, Clone)]
pub struct WorkRecord {
    pub sequence: u16,
    pub issued_at: Instant,
    pub job: TestJob,
    pub hash_job: HashJob,
    pub search_difficulty: u8,
    pub die: u8,
    pub core: u8,
}

/// In-flight work of one die, keyed by sequence.
///
/// Each core keeps only its most recent `depth` records; issuing another
/// job to a core evicts that core's oldest one.
#[derive(Debug)]
pub struct WorkTable {
    records: HashMap<u16, WorkRecord>,
    by_core: Vec<VecDeque<u16>>,
    depth: usize,
}

impl WorkTable {
    /// Active and pending job, plus two more for status lag.
    pub const DEFAULT_DEPTH: usize = 4;

    pub fn new(cores: u8, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            records: HashMap::with_capacity(usize::from(cores) * depth),
            by_core: vec![VecDeque::with_capacity(depth); usize::from(cores)],
            depth,
        }
    }

    /// Most records this table will ever hold.
    pub fn capacity(&self) -> usize {
        self.by_core.len() * self.depth
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, sequence: u16) -> Option<&WorkRecord> {
        self.records.get(&sequence)
    }

    /// Store `record`, returning whatever it displaced: the core's oldest
    /// record once the core is at depth, or a stale record that still held
    /// the same sequence.
    pub fn insert(&mut self, record: WorkRecord) -> Option<WorkRecord> {
        let sequence = record.sequence;
        let core = usize::from(record.core);

        let mut evicted = None;
        if let Some(stale) = self.records.remove(&sequence) {
            if let Some(history) = self.by_core.get_mut(usize::from(stale.core)) {
                history.retain(|&s| s != sequence);
            }
            evicted = Some(stale);
        }

        if let Some(history) = self.by_core.get_mut(core) {
            if history.len() >= self.depth {
                if let Some(oldest) = history.pop_front() {
                    evicted = self.records.remove(&oldest).or(evicted);
                }
            }
            history.push_back(sequence);
            self.records.insert(sequence, record);
        }

        evicted
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_core.iter_mut().for_each(VecDeque::clear);
    }
}

/// Split a status report's job map into per-core active and pending flags.
///
/// Core `i` owns bits `2i` (active) and `2i + 1` (pending) of the map read
/// as a little-endian integer. Bits missing from a short map read as clear.
pub fn decode_core_activity(map: &[u8], cores: u8) -> (Vec<bool>, Vec<bool>) {
    let bits = map.view_bits::<Lsb0>();
    let flag = |index: usize| bits.get(index).is_some_and(|bit| *bit);

    (0..usize::from(cores))
        .map(|core| (flag(2 * core), flag(2 * core + 1)))
        .unzip()
}

/// Split the handshake's core map into one good-core array per die.
///
/// The map is a little-endian integer of `dies * cores` bits, sliced into
/// `cores`-bit chunks from the least significant end. The last die owns the
/// least significant chunk and die 0 the most significant one.
pub fn dice_core_map(map: &[u8], dies: u8, cores: u8) -> std::result::Result<Vec<Vec<bool>>, ProtocolError> {
    let needed = usize::from(dies) * usize::from(cores);
    let bits = map.view_bits::<Lsb0>();
    if bits.len() < needed {
        return Err(ProtocolError::CoreMapTooShort {
            bytes: map.len(),
            dies,
            cores,
        });
    }

    let mut maps: Vec<Vec<bool>> = bits[..needed]
        .chunks(usize::from(cores).max(1))
        .take(usize::from(dies))
        .map(|die| die.iter().by_vals().collect())
        .collect();
    maps.reverse();
    Ok(maps)
}

/// Slot accounting from one status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotCounts {
    pub active_filled: usize,
    pub pending_filled: usize,
    pub free_active: usize,
    pub free_pending: usize,
}

/// A hash frame ready to send, and what issuing it displaced.
#[derive(Debug)]
pub struct Issued {
    pub sequence: u16,
    pub frame: Frame,
    pub evicted: Option<WorkRecord>,
}

/// Scheduling state of one die.
#[derive(Debug)]
pub struct DieState {
    index: u8,
    cores: u8,
    good_cores: Vec<bool>,
    next_sequence: u16,
    work: WorkTable,
    core_sequence: Vec<Option<u16>>,
    last_sequence: Option<u16>,
    free_active: Vec<u8>,
    free_pending: Vec<u8>,
    thermal_cutoff: bool,
    monitor: Option<MonitorSample>,
}

impl DieState {
    pub fn new(index: u8, cores: u8, good_cores: Vec<bool>) -> Self {
        Self {
            index,
            cores,
            good_cores,
            next_sequence: 0,
            work: WorkTable::new(cores, WorkTable::DEFAULT_DEPTH),
            core_sequence: vec![None; usize::from(cores)],
            last_sequence: None,
            free_active: Vec::new(),
            free_pending: Vec::new(),
            thermal_cutoff: false,
            monitor: None,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn cores(&self) -> u8 {
        self.cores
    }

    /// Cores the controller marked working at handshake.
    pub fn good_core_count(&self) -> usize {
        self.good_cores.iter().filter(|&&good| good).count()
    }

    /// Sequence the next issued job will carry.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Newest sequence the die has reported taking in.
    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }

    /// Sequence of the last job sent to `core`.
    pub fn core_sequence(&self, core: u8) -> Option<u16> {
        self.core_sequence.get(usize::from(core)).copied().flatten()
    }

    pub fn free_active(&self) -> &[u8] {
        &self.free_active
    }

    pub fn free_pending(&self) -> &[u8] {
        &self.free_pending
    }

    pub fn thermal_cutoff(&self) -> bool {
        self.thermal_cutoff
    }

    pub fn monitor(&self) -> Option<&MonitorSample> {
        self.monitor.as_ref()
    }

    pub fn work(&self) -> &WorkTable {
        &self.work
    }

    /// In-flight record for a sequence reported back in a nonce.
    pub fn lookup(&self, sequence: u16) -> Option<&WorkRecord> {
        self.work.get(sequence)
    }

    /// Whether `core` may be refilled given the die has seen `last_seen`.
    pub fn is_eligible(&self, core: u8, last_seen: u16) -> bool {
        match self.core_sequence(core) {
            None => true,
            Some(issued) => seq_le(issued, last_seen),
        }
    }

    /// Reconcile a status report against outstanding work.
    ///
    /// Free slots whose core has not yet caught up with its last job are
    /// dropped; the rest are shuffled and replace this die's free lists.
    pub fn apply_status<R: Rng + ?Sized>(
        &mut self,
        status: &StatusReport,
        rng: &mut R,
    ) -> Result<SlotCounts> {
        if status.thermal_cutoff {
            self.thermal_cutoff = true;
            return Err(Error::ThermalFault { die: self.index });
        }

        let (active, pending) = decode_core_activity(&status.core_map, self.cores);
        let last_seen = status.last_sequence;

        let free = |flags: &[bool]| -> Vec<u8> {
            flags
                .iter()
                .zip(0u8..)
                .filter(|(busy, core)| !**busy && self.is_eligible(*core, last_seen))
                .map(|(_, core)| core)
                .collect()
        };
        let mut free_active = free(&active);
        let mut free_pending = free(&pending);
        free_active.shuffle(rng);
        free_pending.shuffle(rng);

        let counts = SlotCounts {
            active_filled: active.iter().filter(|&&busy| busy).count(),
            pending_filled: pending.iter().filter(|&&busy| busy).count(),
            free_active: free_active.len(),
            free_pending: free_pending.len(),
        };

        debug!(
            die = self.index,
            last_sequence = last_seen,
            active_filled = counts.active_filled,
            pending_filled = counts.pending_filled,
            free_active = counts.free_active,
            free_pending = counts.free_pending,
            "Status reconciled"
        );

        self.last_sequence = Some(last_seen);
        self.free_active = free_active;
        self.free_pending = free_pending;
        self.monitor = Some(status.monitor);

        Ok(counts)
    }

    /// Take the active slots to refill this cycle, clearing the list. The
    /// last `throttle` entries are held back.
    pub fn take_active(&mut self, throttle: usize) -> Vec<u8> {
        let mut active = std::mem::take(&mut self.free_active);
        active.truncate(active.len().saturating_sub(throttle));
        active
    }

    /// Take the pending slots, clearing the list.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.free_pending)
    }

    /// Assign the next sequence to `job` on `core` and build its frame.
    pub fn issue(&mut self, core: u8, job: TestJob, search_difficulty: u8, now: Instant) -> Issued {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let hash_job = job.to_hash_job(search_difficulty);
        let frame = Frame::hash(self.index, core, sequence, &hash_job);

        if let Some(slot) = self.core_sequence.get_mut(usize::from(core)) {
            *slot = Some(sequence);
        }
        let evicted = self.work.insert(WorkRecord {
            sequence,
            issued_at: now,
            job,
            hash_job,
            search_difficulty,
            die: self.index,
            core,
        });

        Issued {
            sequence,
            frame,
            evicted,
        }
    }
}

/// All dies of one initialized device.
#[derive(Debug, Default)]
pub struct Scheduler {
    dies: Vec<DieState>,
}

impl Scheduler {
    /// Allocate one [`DieState`] per die reported in the handshake.
    ///
    /// A core map too short for the reported dimensions is logged and every
    /// core treated as good.
    pub fn from_init_ack(ack: &InitAck) -> Self {
        let good = match dice_core_map(&ack.core_map, ack.dies, ack.cores_per_die) {
            Ok(maps) => maps,
            Err(e) => {
                warn!(error = %e, "Unusable core map, assuming all cores good");
                vec![vec![true; usize::from(ack.cores_per_die)]; usize::from(ack.dies)]
            }
        };

        let dies = good
            .into_iter()
            .zip(0u8..)
            .map(|(good_cores, index)| DieState::new(index, ack.cores_per_die, good_cores))
            .collect();

        Self { dies }
    }

    pub fn dies(&self) -> &[DieState] {
        &self.dies
    }

    pub fn dies_mut(&mut self) -> &mut [DieState] {
        &mut self.dies
    }

    pub fn die(&self, die: u8) -> std::result::Result<&DieState, ProtocolError> {
        self.dies.get(usize::from(die)).ok_or(ProtocolError::UnknownDie {
            die,
            dies: self.dies.len(),
        })
    }

    pub fn die_mut(&mut self, die: u8) -> std::result::Result<&mut DieState, ProtocolError> {
        let dies = self.dies.len();
        self.dies
            .get_mut(usize::from(die))
            .ok_or(ProtocolError::UnknownDie { die, dies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use test_case::test_case;

    #[test_case(1, 2, true; "adjacent")]
    #[test_case(2, 1, false; "adjacent_reversed")]
    #[test_case(7, 7, false; "equal")]
    #[test_case(65530, 5, true; "across_wrap")]
    #[test_case(5, 65530, false; "across_wrap_reversed")]
    #[test_case(0, 32767, true; "just_inside_window")]
    #[test_case(0, 32768, false; "half_space")]
    #[test_case(32768, 0, true; "half_space_reversed")]
    fn sequence_less_than(a: u16, b: u16, expected: bool) {
        assert_eq!(seq_lt(a, b), expected);
    }

    #[test]
    fn half_space_is_antisymmetric() {
        // Exactly one ordering holds for any distinct pair, including the
        // pair half the space apart.
        for (a, b) in [(0, 32768), (1, 32769), (65535, 32767), (100, 200)] {
            assert_ne!(seq_lt(a, b), seq_lt(b, a), "{} vs {}", a, b);
        }
    }

    #[test]
    fn sequence_less_or_equal() {
        assert!(seq_le(9, 9));
        assert!(seq_le(65535, 0));
        assert!(!seq_le(0, 65535));
    }

    #[test]
    fn core_activity_bits() {
        let (active, pending) = decode_core_activity(&[0x55, 0x55, 0x00, 0x00], 8);
        assert_eq!(active, vec![true; 8]);
        assert_eq!(pending, vec![false; 8]);

        let (active, pending) = decode_core_activity(&[0b1000_0010], 4);
        assert_eq!(active, vec![false, false, false, false]);
        assert_eq!(pending, vec![true, false, false, true]);
    }

    #[test]
    fn core_activity_short_map_reads_clear() {
        let (active, pending) = decode_core_activity(&[0xff], 8);
        assert_eq!(active, [true, true, true, true, false, false, false, false]);
        assert_eq!(pending, [true, true, true, true, false, false, false, false]);
    }

    #[test]
    fn dice_core_map_last_die_least_significant() {
        let maps = dice_core_map(&[0b1111_0111], 2, 4).unwrap();
        assert_eq!(maps[0], vec![true, true, true, true]);
        assert_eq!(maps[1], vec![true, true, true, false]);
    }

    #[test]
    fn dice_core_map_spans_bytes() {
        // 2 dies x 6 cores: die 0 starts at bit 6.
        let maps = dice_core_map(&[0b1100_0000, 0b0000_1110], 2, 6).unwrap();
        assert_eq!(maps[0], vec![true, true, false, true, true, true]);
        assert_eq!(maps[1], vec![false; 6]);
    }

    #[test]
    fn dice_core_map_three_dies() {
        // Bits 0..4 go to die 2, 4..8 to die 1, 8..12 to die 0.
        let maps = dice_core_map(&[0x21, 0x03], 3, 4).unwrap();
        assert_eq!(maps[0], vec![true, true, false, false]);
        assert_eq!(maps[1], vec![false, true, false, false]);
        assert_eq!(maps[2], vec![true, false, false, false]);
    }

    #[test]
    fn dice_core_map_too_short() {
        assert_eq!(
            dice_core_map(&[0xff], 2, 8),
            Err(ProtocolError::CoreMapTooShort {
                bytes: 1,
                dies: 2,
                cores: 8
            })
        );
    }

    fn status(die: u8, last_sequence: u16, core_map: Vec<u8>) -> StatusReport {
        StatusReport {
            die,
            thermal_cutoff: false,
            tach: 0,
            last_sequence,
            monitor: MonitorSample::default(),
            core_map,
        }
    }

    fn job() -> TestJob {
        TestJob::random(&mut StdRng::seed_from_u64(7))
    }

    #[test]
    fn idle_die_frees_every_slot() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut die = DieState::new(0, 8, vec![true; 8]);

        let counts = die.apply_status(&status(0, 0, vec![0; 4]), &mut rng).unwrap();

        assert_eq!(counts.free_active, 8);
        assert_eq!(counts.free_pending, 8);
        let mut active = die.free_active().to_vec();
        active.sort_unstable();
        assert_eq!(active, (0..8).collect::<Vec<u8>>());
        assert_eq!(die.last_sequence(), Some(0));
    }

    #[test]
    fn acknowledged_core_is_eligible() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut die = DieState::new(0, 4, vec![true; 4]);
        die.next_sequence = 41;
        let issued = die.issue(2, job(), 34, Instant::now());
        assert_eq!(issued.sequence, 41);

        // Core 2 free in both slots, die has seen exactly sequence 41.
        die.apply_status(&status(0, 41, vec![0x00]), &mut rng).unwrap();
        assert!(die.free_active().contains(&2));
        assert!(die.free_pending().contains(&2));
    }

    #[test]
    fn unacknowledged_core_is_excluded() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut die = DieState::new(0, 4, vec![true; 4]);
        die.next_sequence = 41;
        die.issue(2, job(), 34, Instant::now());

        die.apply_status(&status(0, 40, vec![0x00]), &mut rng).unwrap();
        assert!(!die.free_active().contains(&2));
        assert!(!die.free_pending().contains(&2));
        assert_eq!(die.free_active().len(), 3);
    }

    #[test]
    fn eligibility_across_wrap() {
        let mut die = DieState::new(0, 1, vec![true]);
        die.next_sequence = 65535;
        die.issue(0, job(), 34, Instant::now());

        assert!(!die.is_eligible(0, 65534));
        assert!(die.is_eligible(0, 65535));
        assert!(die.is_eligible(0, 3));
    }

    #[test]
    fn thermal_cutoff_marks_die() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut die = DieState::new(3, 8, vec![true; 8]);
        let mut report = status(3, 0, vec![0; 4]);
        report.thermal_cutoff = true;

        let result = die.apply_status(&report, &mut rng);
        assert!(matches!(result, Err(Error::ThermalFault { die: 3 })));
        assert!(die.thermal_cutoff());
    }

    #[test]
    fn take_clears_free_lists() {
        let mut die = DieState::new(0, 8, vec![true; 8]);
        die.free_active = vec![3, 1];
        die.free_pending = vec![5];

        assert_eq!(die.take_active(0), vec![3, 1]);
        assert_eq!(die.take_pending(), vec![5]);
        assert!(die.free_active().is_empty());
        assert!(die.free_pending().is_empty());
        assert!(die.take_pending().is_empty());
    }

    #[test_case(1, &[0, 1, 2, 3]; "one")]
    #[test_case(3, &[0, 1]; "three")]
    #[test_case(9, &[]; "more_than_free")]
    fn take_active_throttled(throttle: usize, expected: &[u8]) {
        let mut die = DieState::new(0, 8, vec![true; 8]);
        die.free_active = vec![0, 1, 2, 3, 4];

        assert_eq!(die.take_active(throttle), expected);
        assert!(die.free_active().is_empty());
    }

    #[test]
    fn issue_post_increments_and_wraps() {
        let mut die = DieState::new(1, 2, vec![true; 2]);
        die.next_sequence = 65535;

        let first = die.issue(0, job(), 34, Instant::now());
        let second = die.issue(1, job(), 34, Instant::now());

        assert_eq!(first.sequence, 65535);
        assert_eq!(second.sequence, 0);
        assert_eq!(die.next_sequence(), 1);
        assert_eq!(die.core_sequence(0), Some(65535));
        assert_eq!(die.core_sequence(1), Some(0));

        assert_eq!(second.frame.chip_address(), 1);
        assert_eq!(second.frame.core_address(), 1);
        assert_eq!(second.frame.hdata(), 0);
        assert_eq!(second.frame.data().len(), HashJob::LEN);

        let record = die.lookup(65535).unwrap();
        assert_eq!((record.die, record.core, record.search_difficulty), (1, 0, 34));
    }

    #[test]
    fn work_table_keeps_recent_jobs_per_core() {
        let mut die = DieState::new(0, 2, vec![true; 2]);
        for _ in 0..WorkTable::DEFAULT_DEPTH {
            assert!(die.issue(0, job(), 34, Instant::now()).evicted.is_none());
        }
        die.issue(1, job(), 34, Instant::now());

        let issued = die.issue(0, job(), 34, Instant::now());
        let evicted = issued.evicted.unwrap();
        assert_eq!(evicted.sequence, 0);
        assert_eq!(evicted.core, 0);
        assert!(die.lookup(0).is_none());
        assert!(die.lookup(1).is_some());
        assert!(die.work().len() <= die.work().capacity());
    }

    #[test]
    fn work_table_replaces_stale_sequence() {
        let mut table = WorkTable::new(2, 4);
        let record = |sequence, core| WorkRecord {
            sequence,
            issued_at: Instant::now(),
            job: job(),
            hash_job: job().to_hash_job(34),
            search_difficulty: 34,
            die: 0,
            core,
        };

        assert!(table.insert(record(9, 0)).is_none());
        let stale = table.insert(record(9, 1)).unwrap();
        assert_eq!(stale.core, 0);
        assert_eq!(table.get(9).unwrap().core, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn scheduler_from_handshake() {
        let frame = Frame::decode(crate::asic::gn::test_data::INIT_ACK_FRAME).unwrap();
        let ack = InitAck::try_from(&frame).unwrap();
        let scheduler = Scheduler::from_init_ack(&ack);

        assert_eq!(scheduler.dies().len(), 1);
        assert_eq!(scheduler.dies()[0].cores(), 8);
        assert_eq!(scheduler.dies()[0].good_core_count(), 8);
        assert_eq!(
            scheduler.die(1).unwrap_err(),
            ProtocolError::UnknownDie { die: 1, dies: 1 }
        );
    }
}
