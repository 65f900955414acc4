//! End-to-end pipeline tests: synthetic frames through the ring buffer,
//! transform and disk writer, then back out through the query layer.

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fa_core::{DecimatedSlot, FaEntry, FilterMask, FA_ENTRY_SIZE};
use fa_storage::prepare::{prepare_archive, PrepareRequest};
use fa_storage::reader::{DataClass, EndSpec, ReadFlags, ReadRequest};
use fa_storage::{
    Archive, ArchiveGeometry, BlockBuffer, OpenMode, Pipeline, PipelineConfig, Reader,
};

const ENTRY_COUNT: usize = 16;
const INPUT_FRAMES: usize = 512;
const MAJOR_SAMPLES: usize = 2048;
const FRAME_INTERVAL: u64 = 100;
const BASE_TS: u64 = 1_000_000_000_000;
/// One major block spans 2048 frames at 100 µs.
const MAJOR_DURATION: u64 = MAJOR_SAMPLES as u64 * FRAME_INTERVAL;

fn geometry(major_block_count: usize) -> ArchiveGeometry {
    ArchiveGeometry {
        fa_entry_count: ENTRY_COUNT,
        first_decimation_log2: 2,
        second_decimation_log2: 7,
        input_block_size: INPUT_FRAMES * ENTRY_COUNT * FA_ENTRY_SIZE,
        major_sample_count: MAJOR_SAMPLES,
        major_block_count,
        archived_id_count: 4,
    }
}

fn archive_mask() -> FilterMask {
    FilterMask::parse("0,3,7,9", ENTRY_COUNT).unwrap()
}

/// Same waveform as the simulated sniffer: id 0 carries the frame
/// counter, other ids a phase pattern.
fn entry_for(id: usize, frame: u64) -> FaEntry {
    if id == 0 {
        FaEntry::new(frame as i32, 0)
    } else {
        let phase = (frame % 16) as i32;
        FaEntry::new(id as i32 * 1000 + phase, -(id as i32) * 1000 - phase)
    }
}

/// Test-side producer standing in for the sniffer thread.
struct Feeder {
    frame: u64,
}

impl Feeder {
    fn new() -> Self {
        Feeder { frame: 0 }
    }

    fn feed_block(&mut self, buffer: &BlockBuffer) {
        let mut slot = buffer.reserve_write();
        {
            let block = slot.buffer();
            let frame_size = ENTRY_COUNT * FA_ENTRY_SIZE;
            for frame in 0..INPUT_FRAMES {
                for id in 0..ENTRY_COUNT {
                    entry_for(id, self.frame + frame as u64)
                        .write_to(&mut block[frame * frame_size + id * FA_ENTRY_SIZE..]);
                }
            }
        }
        self.frame += INPUT_FRAMES as u64;
        // Blocks are timestamped at completion.
        buffer.commit_write(slot, false, BASE_TS + self.frame * FRAME_INTERVAL);
    }

    fn feed_major_blocks(&mut self, buffer: &BlockBuffer, count: usize) {
        for _ in 0..count * (MAJOR_SAMPLES / INPUT_FRAMES) {
            self.feed_block(buffer);
        }
    }

    fn gap(&mut self, buffer: &BlockBuffer, missed_frames: u64) {
        let slot = buffer.reserve_write();
        buffer.commit_write(slot, true, 0);
        self.frame += missed_frames;
    }
}

fn start(
    major_block_count: usize,
) -> (tempfile::TempDir, Arc<Archive>, Pipeline, Reader, Feeder) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.fa");
    prepare_archive(
        &path,
        &PrepareRequest {
            geometry: geometry(major_block_count),
            mask: archive_mask(),
            force: false,
        },
    )
    .unwrap();
    let (archive, write_file) = Archive::open(&path, OpenMode { direct_io: false }).unwrap();
    let pipeline = Pipeline::start(
        Arc::clone(&archive),
        write_file,
        &PipelineConfig { ring_blocks: 16 },
    )
    .unwrap();
    let file = Arc::new(Archive::open_read_handle(&path).unwrap());
    let reader = Reader::new(Arc::clone(&archive), file);
    (dir, archive, pipeline, reader, Feeder::new())
}

fn wait_for_block(archive: &Archive, expected: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while archive.lock.lock().current_major_block != expected {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for major block {expected}"
        );
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn read(reader: &Reader, request: &ReadRequest) -> Vec<u8> {
    let plan = reader.prepare(request).unwrap();
    let mut out = Cursor::new(Vec::new());
    reader.stream(&plan, &mut out).unwrap();
    out.into_inner()
}

fn fa_request(mask: &str, start_us: u64, samples: u64) -> ReadRequest {
    ReadRequest {
        class: DataClass::Fa,
        mask: FilterMask::parse(mask, ENTRY_COUNT).unwrap(),
        start_us,
        end: EndSpec::Samples(samples),
        flags: ReadFlags::default(),
    }
}

#[test]
fn fresh_archive_fills_its_first_major_block() {
    let (_dir, archive, pipeline, reader, mut feeder) = start(6);

    feeder.feed_major_blocks(pipeline.buffer(), 1);
    wait_for_block(&archive, 1);
    pipeline.shutdown().unwrap();

    let entry = archive.metadata.index_entry(0);
    assert_eq!(entry.id_zero, 0);
    assert_eq!(entry.timestamp, BASE_TS);
    assert!((i64::from(entry.duration) - MAJOR_DURATION as i64).abs() <= 1);

    let header = archive.metadata.read_header();
    let mbs = archive.geometry.major_block_size() as i64;
    assert_eq!(header.disk_status, 0);
    assert_eq!(header.block_count, 1);
    assert_eq!(header.segments[0].start_offset, 0);
    assert_eq!(header.segments[0].stop_offset, mbs);
    assert_eq!(header.current_major_block, 1);

    // Read id 3's column back and verify the waveform survived the
    // transpose and the disk round trip.
    let data = read(&reader, &fa_request("3", BASE_TS, MAJOR_SAMPLES as u64));
    assert_eq!(data.len(), MAJOR_SAMPLES * FA_ENTRY_SIZE);
    for sample in 0..MAJOR_SAMPLES {
        let entry = FaEntry::read_from(&data[sample * FA_ENTRY_SIZE..]);
        assert_eq!(entry, entry_for(3, sample as u64), "sample {sample}");
    }
}

#[test]
fn wrapping_the_data_region_keeps_one_advancing_segment() {
    let (_dir, archive, pipeline, reader, mut feeder) = start(6);

    // 8 majors through a 6-block region: one full wrap and two more.
    feeder.feed_major_blocks(pipeline.buffer(), 8);
    wait_for_block(&archive, 2);
    pipeline.shutdown().unwrap();

    let header = archive.metadata.read_header();
    let mbs = archive.geometry.major_block_size() as i64;
    assert_eq!(header.block_count, 1, "no gap, so a single segment");
    assert_eq!(header.segments[0].stop_offset, 2 * mbs);
    assert_eq!(
        header.segments[0].start_offset, 2 * mbs,
        "the segment start chased the write cursor through the wrap"
    );

    // The oldest surviving data is major block 5, in disk block 5.
    assert_eq!(reader.earliest_timestamp(), BASE_TS + 5 * MAJOR_DURATION);
    let data = read(
        &reader,
        &fa_request("0", BASE_TS + 5 * MAJOR_DURATION, MAJOR_SAMPLES as u64),
    );
    let first = FaEntry::read_from(&data[..FA_ENTRY_SIZE]);
    assert_eq!(first.x, 5 * MAJOR_SAMPLES as i32);
}

#[test]
fn gap_starts_a_new_segment_and_splits_queries() {
    let (_dir, archive, pipeline, reader, mut feeder) = start(8);
    const MISSED: u64 = 10_000;

    feeder.feed_major_blocks(pipeline.buffer(), 3);
    wait_for_block(&archive, 3);
    feeder.gap(pipeline.buffer(), MISSED);
    feeder.feed_major_blocks(pipeline.buffer(), 2);
    wait_for_block(&archive, 5);
    pipeline.shutdown().unwrap();

    let header = archive.metadata.read_header();
    let mbs = archive.geometry.major_block_size() as i64;
    assert_eq!(header.block_count, 2);
    assert_eq!(header.segments[0].start_offset, 3 * mbs);
    assert_eq!(header.segments[0].stop_offset, 5 * mbs);
    assert_eq!(header.segments[1].start_offset, 0);
    assert_eq!(header.segments[1].stop_offset, 3 * mbs);

    // The frame counter records the missed frames.
    assert_eq!(
        archive.metadata.index_entry(3).id_zero as u64,
        3 * MAJOR_SAMPLES as u64 + MISSED
    );

    // A range spanning the gap is refused by default...
    let mut request = fa_request("0", BASE_TS + 2 * MAJOR_DURATION, 2 * MAJOR_SAMPLES as u64);
    let err = reader.prepare(&request).unwrap_err();
    assert_eq!(err.to_string(), "Data gap in selected range");

    // ...and with check_id0 the counter break alone is enough to refuse.
    request.flags.check_id0 = true;
    assert!(reader.prepare(&request).is_err());

    // With all_data the two sides are concatenated.
    request.flags.check_id0 = false;
    request.flags.all_data = true;
    let data = read(&reader, &request);
    assert_eq!(data.len(), 2 * MAJOR_SAMPLES * FA_ENTRY_SIZE);
    let last_before = FaEntry::read_from(&data[(MAJOR_SAMPLES - 1) * FA_ENTRY_SIZE..]);
    let first_after = FaEntry::read_from(&data[MAJOR_SAMPLES * FA_ENTRY_SIZE..]);
    assert_eq!(last_before.x as u64, 3 * MAJOR_SAMPLES as u64 - 1);
    assert_eq!(first_after.x as u64, 3 * MAJOR_SAMPLES as u64 + MISSED);
}

#[test]
fn decimated_and_double_decimated_reads_carry_statistics() {
    let (_dir, archive, pipeline, reader, mut feeder) = start(8);

    feeder.feed_major_blocks(pipeline.buffer(), 2);
    wait_for_block(&archive, 2);
    pipeline.shutdown().unwrap();

    // First decimation of id 0: groups of 4 consecutive counter values.
    let request = ReadRequest {
        class: DataClass::Dec,
        mask: FilterMask::parse("0", ENTRY_COUNT).unwrap(),
        start_us: BASE_TS,
        end: EndSpec::Samples(512),
        flags: ReadFlags::default(),
    };
    let data = read(&reader, &request);
    assert_eq!(data.len(), 512 * 32);
    for group in 0..512usize {
        let slot = DecimatedSlot::read_from(&data[group * 32..]);
        assert_eq!(slot.min.x, 4 * group as i32);
        assert_eq!(slot.max.x, 4 * group as i32 + 3);
        assert_eq!(slot.mean.x, 4 * group as i32 + 1);
    }

    // Double decimation: 4 slots per major block, each covering 512
    // frames of the rolling counter.
    let request = ReadRequest {
        class: DataClass::DoubleDec,
        mask: FilterMask::parse("0", ENTRY_COUNT).unwrap(),
        start_us: BASE_TS,
        end: EndSpec::Samples(8),
        flags: ReadFlags::default(),
    };
    let plan = reader.prepare(&request).unwrap();
    assert_eq!(plan.count, 8);
    let data = read(&reader, &request);
    assert_eq!(data.len(), 8 * 32);
    for (index, chunk) in data.chunks(32).enumerate() {
        let slot = DecimatedSlot::read_from(chunk);
        let start = 512 * index as i32;
        assert_eq!(slot.min.x, start);
        assert_eq!(slot.max.x, start + 511);
        assert!(slot.min.x <= slot.mean.x && slot.mean.x <= slot.max.x);
        // A linear ramp has a known standard deviation of ~147.8.
        assert!((slot.std.x - 147).abs() <= 1, "std {}", slot.std.x);
    }
}
