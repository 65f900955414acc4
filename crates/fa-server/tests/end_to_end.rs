//! Socket-level tests: a simulated sniffer feeds a real pipeline and
//! clients talk to the server over TCP.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fa_core::{FaEntry, FilterMask, FA_ENTRY_SIZE};
use fa_server::{Server, ServerConfig};
use fa_sniffer::{SimulationConfig, SimulationSource, SnifferConfig, SnifferSource, SnifferThread};
use fa_storage::prepare::{prepare_archive, PrepareRequest};
use fa_storage::{Archive, ArchiveGeometry, OpenMode, Pipeline, PipelineConfig};

const ENTRY_COUNT: usize = 16;
const MAJOR_SAMPLES: usize = 2048;
/// 2026-era epoch seconds, whole so request lines stay simple.
const SIM_SECONDS: u64 = 1_700_000_000;
const SIM_TS: u64 = SIM_SECONDS * 1_000_000;

struct Rig {
    _dir: tempfile::TempDir,
    archive: Arc<Archive>,
    pipeline: Option<Pipeline>,
    sniffer: Option<SnifferThread>,
    server: Option<Server>,
}

impl Rig {
    /// Archive five complete major blocks from the simulated sniffer,
    /// then serve them.
    fn start(config: ServerConfig) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e2e.fa");
        prepare_archive(
            &path,
            &PrepareRequest {
                geometry: ArchiveGeometry {
                    fa_entry_count: ENTRY_COUNT,
                    first_decimation_log2: 2,
                    second_decimation_log2: 7,
                    input_block_size: 512 * ENTRY_COUNT * FA_ENTRY_SIZE,
                    major_sample_count: MAJOR_SAMPLES,
                    major_block_count: 8,
                    archived_id_count: 4,
                },
                mask: FilterMask::parse("0-3", ENTRY_COUNT).unwrap(),
                force: false,
            },
        )
        .unwrap();

        let (archive, write_file) =
            Archive::open(&path, OpenMode { direct_io: false }).unwrap();
        let pipeline = Pipeline::start(
            Arc::clone(&archive),
            write_file,
            &PipelineConfig { ring_blocks: 16 },
        )
        .unwrap();

        let source = Arc::new(SimulationSource::new(SimulationConfig {
            entry_count: ENTRY_COUNT,
            frame_interval_us: 100,
            start_timestamp: SIM_TS,
            paced: false,
            total_frames: Some(5 * MAJOR_SAMPLES as u64),
        }));
        let sniffer = SnifferThread::spawn(
            source as Arc<dyn SnifferSource>,
            Arc::clone(pipeline.buffer()),
            SnifferConfig {
                boost_priority: false,
                retry_delay: Duration::from_millis(5),
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while archive.lock.lock().current_major_block != 5 {
            assert!(Instant::now() < deadline, "pipeline never filled 5 blocks");
            std::thread::sleep(Duration::from_millis(2));
        }

        let file = Arc::new(Archive::open_read_handle(&path).unwrap());
        let server = Server::start(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&archive),
            file,
            config,
        )
        .unwrap();

        Rig {
            _dir: dir,
            archive,
            pipeline: Some(pipeline),
            sniffer: Some(sniffer),
            server: Some(server),
        }
    }

    fn address(&self) -> SocketAddr {
        self.server.as_ref().unwrap().address()
    }

    fn query(&self, line: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.address()).unwrap();
        stream.write_all(line.as_bytes()).unwrap();
        stream.write_all(b"\n").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }

    fn shutdown(mut self) {
        let pipeline = self.pipeline.take().unwrap();
        pipeline.buffer().stop();
        self.sniffer.take().unwrap().stop();
        pipeline.shutdown().unwrap();
        self.server.take().unwrap().shutdown();
    }
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

#[test]
fn server_info_reports_geometry_and_time_span() {
    let rig = Rig::start(ServerConfig::default());
    let response = rig.query("S");
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("FA "), "got {text:?}");
    assert!(text.contains("entries:16"));
    assert!(text.contains("d1:4"));
    assert!(text.contains("d2:128"));
    assert!(text.contains(&format!("first:{SIM_TS}")));
    rig.shutdown();
}

#[test]
fn raw_read_streams_prefixes_and_frames() {
    let rig = Rig::start(ServerConfig::default());
    let response = rig.query(&format!("RF1TZS{SIM_SECONDS}N100"));

    assert_eq!(response[0], 0, "success marker");
    // Z prefix (count), then T prefix (first timestamp).
    assert_eq!(u64_at(&response, 1), 100);
    assert_eq!(u64_at(&response, 9), SIM_TS);
    assert_eq!(response.len(), 17 + 100 * FA_ENTRY_SIZE);

    for sample in 0..100usize {
        let entry = FaEntry::read_from(&response[17 + sample * FA_ENTRY_SIZE..]);
        assert_eq!(entry.x, 1000 + (sample % 16) as i32, "sample {sample}");
        assert_eq!(entry.y, -1000 - (sample % 16) as i32);
    }
    rig.shutdown();
}

#[test]
fn two_id_read_interleaves_columns() {
    let rig = Rig::start(ServerConfig::default());
    let response = rig.query(&format!("RF0,2S{SIM_SECONDS}N16"));

    assert_eq!(response[0], 0);
    assert_eq!(response.len(), 1 + 16 * 2 * FA_ENTRY_SIZE);
    for sample in 0..16usize {
        let at = 1 + sample * 2 * FA_ENTRY_SIZE;
        let id0 = FaEntry::read_from(&response[at..]);
        let id2 = FaEntry::read_from(&response[at + FA_ENTRY_SIZE..]);
        assert_eq!(id0.x, sample as i32, "id 0 carries the frame counter");
        assert_eq!(id2.x, 2000 + (sample % 16) as i32);
    }
    rig.shutdown();
}

#[test]
fn double_decimated_read_returns_slots() {
    let rig = Rig::start(ServerConfig::default());
    let response = rig.query(&format!("RDD0S{SIM_SECONDS}N4"));
    assert_eq!(response[0], 0);
    assert_eq!(response.len(), 1 + 4 * 32);

    for (index, chunk) in response[1..].chunks(32).enumerate() {
        let slot = fa_core::DecimatedSlot::read_from(chunk);
        // Each slot covers 512 frames of the rolling counter.
        assert_eq!(slot.min.x, 512 * index as i32);
        assert_eq!(slot.max.x, 512 * index as i32 + 511);
        assert!(slot.min.x <= slot.mean.x && slot.mean.x <= slot.max.x);
    }
    rig.shutdown();
}

#[test]
fn protocol_errors_are_single_lines() {
    let rig = Rig::start(ServerConfig::default());

    let response = rig.query(&format!("RF0S{}N10", SIM_SECONDS + 500_000));
    assert_eq!(response, b"Start time too late\n");

    let response = rig.query("RF12S1700000000N10");
    assert_eq!(response, b"BPM id 12 is not archived\n");

    let response = rig.query("bogus");
    assert_eq!(response, b"Unrecognised request\n");

    let response = rig.query("M0-3");
    assert_eq!(response, b"Mask update not permitted\n");
    rig.shutdown();
}

#[test]
fn mask_update_requires_matching_popcount() {
    let rig = Rig::start(ServerConfig {
        allow_mask_update: true,
    });

    let response = rig.query("M0-7");
    assert_eq!(response, b"Mask must select exactly 4 ids\n");

    let response = rig.query("M4-7");
    assert_eq!(response, b"\0");
    assert_eq!(rig.archive.mask.read().format(), "4-7");
    rig.shutdown();
}
