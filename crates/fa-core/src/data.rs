//! FA frame entries and decimated statistics.
//!
//! An FA frame is a row of N `FaEntry` position readings, one per BPM id.
//! Decimation reduces groups of `2^shift` consecutive entries of one BPM
//! to a single [`DecimatedSlot`] carrying min, max, mean and standard
//! deviation of x and y.
//!
//! The variance calculation is numerically delicate: it uses the
//! single-pass form `var = SUM(x^2)/N - mean^2`, which demands very wide
//! intermediates when the mean is large. A 32-bit sample squared needs up
//! to 62 bits and summing 2^16 of them needs ~78, so the squared sums are
//! held in `u128`.

/// One BPM reading: an (x, y) position pair.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaEntry {
    pub x: i32,
    pub y: i32,
}

/// Size of one [`FaEntry`] on disk and on the wire.
pub const FA_ENTRY_SIZE: usize = 8;

const _: () = assert!(std::mem::size_of::<FaEntry>() == FA_ENTRY_SIZE);

impl FaEntry {
    pub fn new(x: i32, y: i32) -> Self {
        FaEntry { x, y }
    }

    /// Serialise in native byte order at the start of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.x.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.y.to_ne_bytes());
    }

    /// Deserialise from the start of `buf` (native byte order).
    pub fn read_from(buf: &[u8]) -> Self {
        FaEntry {
            x: i32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            y: i32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

/// Statistics of one decimated group: min, max, mean and standard
/// deviation of x and y.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecimatedSlot {
    pub min: FaEntry,
    pub max: FaEntry,
    pub mean: FaEntry,
    pub std: FaEntry,
}

/// Size of one [`DecimatedSlot`] on disk and on the wire.
pub const DECIMATED_SLOT_SIZE: usize = 32;

const _: () = assert!(std::mem::size_of::<DecimatedSlot>() == DECIMATED_SLOT_SIZE);

impl DecimatedSlot {
    pub fn write_to(&self, buf: &mut [u8]) {
        self.min.write_to(&mut buf[0..8]);
        self.max.write_to(&mut buf[8..16]);
        self.mean.write_to(&mut buf[16..24]);
        self.std.write_to(&mut buf[24..32]);
    }

    pub fn read_from(buf: &[u8]) -> Self {
        DecimatedSlot {
            min: FaEntry::read_from(&buf[0..8]),
            max: FaEntry::read_from(&buf[8..16]),
            mean: FaEntry::read_from(&buf[16..24]),
            std: FaEntry::read_from(&buf[24..32]),
        }
    }
}

/// Running accumulator for one BPM over one decimation stage.
///
/// Accumulators compose: first-stage group accumulators are merged into a
/// per-id second-stage accumulator, so the double decimation is computed
/// in a single pass over the data.
#[derive(Debug, Clone, Copy)]
pub struct StatAccumulator {
    min_x: i32,
    max_x: i32,
    min_y: i32,
    max_y: i32,
    sum_x: i64,
    sum_y: i64,
    sum_sq_x: u128,
    sum_sq_y: u128,
}

impl Default for StatAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatAccumulator {
    pub fn new() -> Self {
        StatAccumulator {
            min_x: i32::MAX,
            max_x: i32::MIN,
            min_y: i32::MAX,
            max_y: i32::MIN,
            sum_x: 0,
            sum_y: 0,
            sum_sq_x: 0,
            sum_sq_y: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Fold one sample in.
    pub fn accumulate(&mut self, entry: FaEntry) {
        let (x, y) = (entry.x, entry.y);
        self.min_x = self.min_x.min(x);
        self.max_x = self.max_x.max(x);
        self.min_y = self.min_y.min(y);
        self.max_y = self.max_y.max(y);
        self.sum_x += i64::from(x);
        self.sum_y += i64::from(y);
        self.sum_sq_x += (i64::from(x) * i64::from(x)) as u128;
        self.sum_sq_y += (i64::from(y) * i64::from(y)) as u128;
    }

    /// Fold a completed lower-stage accumulator in.
    pub fn merge(&mut self, other: &StatAccumulator) {
        self.min_x = self.min_x.min(other.min_x);
        self.max_x = self.max_x.max(other.max_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_y = self.max_y.max(other.max_y);
        self.sum_x += other.sum_x;
        self.sum_y += other.sum_y;
        self.sum_sq_x += other.sum_sq_x;
        self.sum_sq_y += other.sum_sq_y;
    }

    /// Produce the statistics slot for a group of `2^shift` samples.
    ///
    /// The mean is a truncating arithmetic shift; the variance switches
    /// to floating point after the shift, clamping the small negative
    /// values that rounding can produce.
    pub fn finalise(&self, shift: u32) -> DecimatedSlot {
        DecimatedSlot {
            min: FaEntry::new(self.min_x, self.min_y),
            max: FaEntry::new(self.max_x, self.max_y),
            mean: FaEntry::new((self.sum_x >> shift) as i32, (self.sum_y >> shift) as i32),
            std: FaEntry::new(
                compute_std(self.sum_sq_x, self.sum_x, shift),
                compute_std(self.sum_sq_y, self.sum_y, shift),
            ),
        }
    }
}

fn compute_std(sum_sq: u128, sum: i64, shift: u32) -> i32 {
    let mean = sum as f64 / (1u64 << shift) as f64;
    let var = (sum_sq >> shift) as f64 - mean * mean;
    if var > 0.0 {
        var.sqrt() as i32
    } else {
        0
    }
}
