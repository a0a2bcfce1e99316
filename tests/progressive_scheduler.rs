//! Progressive frame scheduling over a real dataset and brick cache.

use std::time::Duration;

use uvf::cache::{BrickCache, HeadlessBackend, HeadlessTexture};
use uvf::config::StreamingConfig;
use uvf::dataset::VolumeDataset;
use uvf::render::{BrickDraw, FrameState, ManualClock, ProgressiveScheduler, RenderSink};
use uvf::store::Endian;
use uvf::uvf::{BrickIndex, ChecksumScheme, Container, GlobalHeader, RasterDataBlock};

use tempfile::NamedTempFile;

/// 24^3 volume in 8^3 bricks without halo: 27 finest bricks of 512 bytes,
/// levels of 12^3 and a single 6^3 (216 byte) brick at the coarsest.
fn write_dataset(path: &std::path::Path) {
    let mut raster = RasterDataBlock::volume("volume", [24, 24, 24], 8, 0, 2);
    let flat: Vec<u8> = (0..24 * 24 * 24u32).map(|i| (i / 7 % 256) as u8).collect();
    raster.build_from_flat_data(&flat).expect("Failed to build pyramid");
    let mut container = Container::new(path, GlobalHeader::new(ChecksumScheme::Md5, Endian::Little));
    container.add_data_block(raster).expect("Failed to add raster");
    container.create().expect("Failed to write container");
}

/// Sink whose draws cost a fixed amount of (manual) time.
struct TimedSink<'a> {
    clock: &'a ManualClock,
    cost: Duration,
    drawn: Vec<(BrickIndex, BrickIndex)>,
    pre: u32,
    post: u32,
}

impl<'a> TimedSink<'a> {
    fn new(clock: &'a ManualClock, cost: Duration) -> Self {
        Self { clock, cost, drawn: Vec::new(), pre: 0, post: 0 }
    }
}

impl RenderSink<HeadlessTexture> for TimedSink<'_> {
    fn pre_render_bounding_boxes(&mut self, _frame: u64) {
        self.pre += 1;
    }

    fn draw_brick(&mut self, draw: &BrickDraw<'_>, texture: &HeadlessTexture) -> uvf::Result<()> {
        assert_eq!(self.post, 0, "no bricks after the closing pass");
        assert!(texture.desc.voxel_count() > 0);
        self.clock.advance(self.cost);
        self.drawn.push((draw.requested.clone(), draw.drawn.clone()));
        Ok(())
    }

    fn post_render_bounding_boxes(&mut self, _frame: u64) {
        self.post += 1;
    }
}

#[test]
fn test_frame_completes_in_ceil_k_over_m_slices() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_dataset(temp.path());
    let ds = VolumeDataset::open(temp.path(), &StreamingConfig::default()).expect("Failed to open dataset");
    let list = ds.brick_list(&[0]).expect("brick list");
    let k = list.len() as u64;
    assert_eq!(k, 27);

    for m in [1u64, 5, 7, 27] {
        let clock = ManualClock::new();
        let mut sink = TimedSink::new(&clock, Duration::from_millis(2));
        let mut cache = BrickCache::new(HeadlessBackend::new(), 1 << 20);
        let mut scheduler = ProgressiveScheduler::new(Duration::from_millis(2 * m), true);

        scheduler.begin_frame(list.clone());
        assert_eq!(scheduler.state(), FrameState::Rendering);
        let mut slices = 0;
        while scheduler.needs_redraw() {
            let report = scheduler.advance(&mut cache, &ds, &mut sink, &clock);
            slices += 1;
            assert!(report.drawn <= m);
            assert!(slices <= k, "scheduler made no progress");
        }

        assert_eq!(scheduler.state(), FrameState::FrameComplete);
        assert_eq!(slices, k.div_ceil(m), "M = {}", m);
        assert_eq!(scheduler.progress().slices, slices);
        assert_eq!((sink.pre, sink.post), (1, 1));
        let requested: Vec<BrickIndex> = sink.drawn.iter().map(|(r, _)| r.clone()).collect();
        assert_eq!(requested, list, "each brick exactly once, in list order");
        assert!(sink.drawn.iter().all(|(r, d)| r == d));
    }
}

#[test]
fn test_abort_discards_progress() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_dataset(temp.path());
    let ds = VolumeDataset::open(temp.path(), &StreamingConfig::default()).expect("Failed to open dataset");
    let list = ds.brick_list(&[0]).expect("brick list");

    let clock = ManualClock::new();
    let mut sink = TimedSink::new(&clock, Duration::from_millis(1));
    let mut cache = BrickCache::new(HeadlessBackend::new(), 1 << 20);
    let mut scheduler = ProgressiveScheduler::new(Duration::from_millis(10), true);

    scheduler.begin_frame(list.clone());
    scheduler.advance(&mut cache, &ds, &mut sink, &clock);
    assert_eq!(scheduler.progress().brick_index, 10);

    assert!(scheduler.abort());
    assert_eq!(scheduler.state(), FrameState::Idle);
    assert_eq!(scheduler.progress().brick_index, 0);
    assert_eq!(scheduler.progress().brick_count, 0);
    assert!(!scheduler.abort());

    // Bricks drawn in the aborted frame are still cached for the next one.
    let frame = scheduler.begin_frame(list);
    assert_eq!(frame, 2);
    let misses_before = cache.stats().misses;
    scheduler.advance(&mut cache, &ds, &mut sink, &clock);
    assert_eq!(cache.stats().misses, misses_before);
    assert_eq!(sink.pre, 2);
}

#[test]
fn test_degrades_to_coarser_lod_when_budget_is_pinned() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_dataset(temp.path());
    let ds = VolumeDataset::open(temp.path(), &StreamingConfig::default()).expect("Failed to open dataset");

    // Budget of 1.5 finest bricks with one finest brick pinned elsewhere:
    // neither an 8^3 brick fits nor its 8^3 parent, the 6^3 root does.
    let mut cache = BrickCache::new(HeadlessBackend::new(), 768);
    let pinned = cache.acquire(&ds, &[0], &[2, 2, 2]).expect("pin");

    let clock = ManualClock::new();
    let mut sink = TimedSink::new(&clock, Duration::from_millis(1));
    let mut scheduler = ProgressiveScheduler::new(Duration::from_millis(100), true);
    let list = ds.brick_list(&[0]).expect("brick list");
    scheduler.begin_frame(list[..2].to_vec());
    let report = scheduler.advance(&mut cache, &ds, &mut sink, &clock);

    assert_eq!(report.state, FrameState::FrameComplete);
    assert_eq!(report.substituted, 2);
    assert_eq!(sink.drawn.len(), 2);
    for (requested, drawn) in &sink.drawn {
        assert_eq!(requested.lod.as_slice(), &[0]);
        assert_eq!(drawn.lod.as_slice(), &[2]);
        assert_eq!(drawn.brick.as_slice(), &[0, 0, 0]);
    }
    assert_eq!(cache.stats().uploads, 2);
    cache.release(pinned).expect("release pin");
}

#[test]
fn test_stalls_without_fallback_and_resumes() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_dataset(temp.path());
    let ds = VolumeDataset::open(temp.path(), &StreamingConfig::default()).expect("Failed to open dataset");

    let mut cache = BrickCache::new(HeadlessBackend::new(), 768);
    let pinned = cache.acquire(&ds, &[0], &[2, 2, 2]).expect("pin");

    let clock = ManualClock::new();
    let mut sink = TimedSink::new(&clock, Duration::from_millis(1));
    let mut scheduler = ProgressiveScheduler::new(Duration::from_millis(100), false);
    let list = ds.brick_list(&[0]).expect("brick list");
    scheduler.begin_frame(list[..2].to_vec());

    let report = scheduler.advance(&mut cache, &ds, &mut sink, &clock);
    assert!(report.stalled);
    assert_eq!(report.state, FrameState::Rendering);
    assert_eq!(scheduler.progress().brick_index, 0);
    assert!(sink.drawn.is_empty());

    cache.release(pinned).expect("release pin");
    let report = scheduler.advance(&mut cache, &ds, &mut sink, &clock);
    assert!(!report.stalled);
    assert_eq!(report.state, FrameState::FrameComplete);
    assert_eq!(sink.drawn.len(), 2);
    assert_eq!((sink.pre, sink.post), (1, 1));
}

#[test]
fn test_brick_larger_than_budget_is_skipped() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_dataset(temp.path());
    let ds = VolumeDataset::open(temp.path(), &StreamingConfig::default()).expect("Failed to open dataset");

    let mut cache = BrickCache::new(HeadlessBackend::new(), 256);
    let clock = ManualClock::new();
    let mut sink = TimedSink::new(&clock, Duration::from_millis(1));
    let mut scheduler = ProgressiveScheduler::new(Duration::from_millis(100), false);
    scheduler.begin_frame(ds.brick_list(&[0]).expect("brick list")[..3].to_vec());

    let report = scheduler.advance(&mut cache, &ds, &mut sink, &clock);
    assert_eq!(report.state, FrameState::FrameComplete);
    assert_eq!(report.skipped, 3);
    assert!(sink.drawn.is_empty());
}
