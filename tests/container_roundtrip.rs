//! Integration tests for writing UVF containers and reading them back.

use uvf::store::Endian;
use uvf::uvf::{
    Block, BlockSemantic, ChecksumScheme, CompressionScheme, Container, GlobalHeader,
    Histogram1DDataBlock, Histogram2DDataBlock, KeyValuePairDataBlock, OpaqueBlock, OpenOptions,
    RasterDataBlock,
};
use uvf::Error;

use tempfile::NamedTempFile;

/// Sphere-ish test volume: value falls off with distance from the centre.
fn test_volume(size: u64, brick: u64) -> RasterDataBlock {
    let mut raster = RasterDataBlock::volume("volume", [size, size, size], brick, 1, 2);
    let c = size as f64 / 2.0;
    let mut flat = Vec::with_capacity((size * size * size) as usize);
    for z in 0..size {
        for y in 0..size {
            for x in 0..size {
                let d = ((x as f64 - c).powi(2) + (y as f64 - c).powi(2) + (z as f64 - c).powi(2)).sqrt();
                flat.push((255.0 - d * 8.0).max(0.0) as u8);
            }
        }
    }
    raster.build_from_flat_data(&flat).expect("Failed to build pyramid");
    raster
}

fn assert_same_layout(a: &RasterDataBlock, b: &RasterDataBlock) {
    assert_eq!(a.id, b.id);
    assert_eq!(a.compression, b.compression);
    assert_eq!(a.domain_semantics, b.domain_semantics);
    assert_eq!(a.transformation, b.transformation);
    assert_eq!(a.domain_size, b.domain_size);
    assert_eq!(a.brick_size, b.brick_size);
    assert_eq!(a.brick_overlap, b.brick_overlap);
    assert_eq!(a.lod_dec_factor, b.lod_dec_factor);
    assert_eq!(a.lod_groups, b.lod_groups);
    assert_eq!(a.lod_level_count, b.lod_level_count);
    assert_eq!(a.elements, b.elements);
}

fn assert_same_bricks(a: &RasterDataBlock, b: &RasterDataBlock) {
    for lod in a.lod_permutations() {
        let counts = a.brick_count(&lod).expect("brick count");
        for brick in uvf::util::GridIter::new(&counts) {
            let left = a.get_data(&lod, &brick).expect("read source brick");
            let right = b.get_data(&lod, &brick).expect("read stored brick");
            assert_eq!(left, right, "brick {:?} at LOD {:?}", brick.as_slice(), lod.as_slice());
        }
    }
}

fn write_full_container(path: &std::path::Path, scheme: ChecksumScheme, endian: Endian) -> RasterDataBlock {
    let raster = test_volume(24, 8);
    let mut h1 = Histogram1DDataBlock::new("hist1d");
    h1.compute(&raster).expect("Failed to compute 1D histogram");
    let mut h2 = Histogram2DDataBlock::new("hist2d");
    h2.compute(&raster).expect("Failed to compute 2D histogram");
    let mut kv = KeyValuePairDataBlock::new("meta");
    kv.add_pair("patient", "phantom");
    kv.add_pair("modality", "synthetic");

    let mut container = Container::new(path, GlobalHeader::new(scheme, endian));
    container.add_data_block(raster.clone()).expect("Failed to add raster");
    container.add_data_block(h1).expect("Failed to add 1D histogram");
    container.add_data_block(h2).expect("Failed to add 2D histogram");
    container.add_data_block(kv).expect("Failed to add metadata");
    container.create().expect("Failed to write container");
    raster
}

#[test]
fn test_roundtrip_all_block_kinds() {
    for (scheme, endian) in [
        (ChecksumScheme::Crc32, Endian::Little),
        (ChecksumScheme::Md5, Endian::Big),
        (ChecksumScheme::None, Endian::Little),
    ] {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        let source = write_full_container(temp.path(), scheme, endian);

        let opened = Container::open(temp.path(), OpenOptions::default()).expect("Failed to open container");
        assert_eq!(opened.header().checksum_scheme, scheme);
        assert_eq!(opened.header().endian, endian);
        assert_eq!(opened.blocks().len(), 4);

        let stored = opened.blocks()[0].as_raster().expect("first block is a raster");
        assert_same_layout(&source, stored);
        assert_same_bricks(&source, stored);

        let mut h1 = Histogram1DDataBlock::new("hist1d");
        h1.compute(&source).expect("recompute");
        assert_eq!(opened.blocks()[1].as_histogram_1d(), Some(&h1));

        let h2 = opened.blocks()[2].as_histogram_2d().expect("2D histogram");
        assert_eq!(h2.gradient_bins(), 256);
        // Coarsest level is 6^3; the stencil skips the 1-voxel border.
        assert_eq!(h2.total(), 4 * 4 * 4);

        let kv = opened.find("meta").and_then(Block::as_key_value).expect("metadata");
        assert_eq!(kv.pairs().len(), 2);
        assert_eq!(kv.get("modality"), Some("synthetic"));
    }
}

#[test]
fn test_checksum_detects_flipped_byte() {
    for scheme in [ChecksumScheme::Crc32, ChecksumScheme::Md5] {
        let temp = NamedTempFile::new().expect("Failed to create temp file");
        write_full_container(temp.path(), scheme, Endian::Little);
        let pristine = std::fs::read(temp.path()).expect("Failed to read file");
        let first_covered = Container::open(temp.path(), OpenOptions::default())
            .expect("pristine file verifies")
            .header()
            .checksum_end() as usize;

        // First covered byte sits in the offset-to-first-block field.
        for at in [first_covered, pristine.len() / 2, pristine.len() - 1] {
            let mut bytes = pristine.clone();
            bytes[at] ^= 0x01;
            std::fs::write(temp.path(), &bytes).expect("Failed to write file");

            let err = Container::open(temp.path(), OpenOptions::default())
                .expect_err("corruption must be detected");
            assert!(matches!(err, Error::ChecksumMismatch { .. }), "byte {}: got {:?}", at, err);
            assert_eq!(err.kind(), uvf::ErrorKind::Format);
        }

        let mut bytes = pristine.clone();
        bytes[pristine.len() / 2] ^= 0x01;
        std::fs::write(temp.path(), &bytes).expect("Failed to write file");
        let unverified = Container::open(temp.path(), OpenOptions::default().verify(false))
            .expect("unverified open should succeed");
        assert_eq!(unverified.blocks().len(), 4);
    }
}

#[test]
fn test_overflowing_raster_layout_is_kept_opaque() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    let mut raster = RasterDataBlock::volume("volume", [5, 6, 7], 8, 0, 2);
    raster.build_from_flat_data(&vec![3u8; 5 * 6 * 7]).expect("Failed to build pyramid");
    let mut container = Container::new(temp.path(), GlobalHeader::new(ChecksumScheme::None, Endian::Little));
    container.add_data_block(raster).expect("Failed to add raster");
    container.create().expect("Failed to write container");

    // Domain then brick size, each three u64 little-endian values.
    let mut bytes = std::fs::read(temp.path()).expect("Failed to read file");
    let layout: Vec<u8> = [5u64, 6, 7, 8, 8, 8].iter().flat_map(|v| v.to_le_bytes()).collect();
    let at = bytes
        .windows(layout.len())
        .position(|w| w == layout.as_slice())
        .expect("raster layout in file");
    let huge: Vec<u8> = [1u64 << 40, 1 << 40, 1 << 40, 1 << 39, 1 << 39, 1 << 39]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    bytes[at..at + huge.len()].copy_from_slice(&huge);
    std::fs::write(temp.path(), &bytes).expect("Failed to write file");

    let opened = Container::open(temp.path(), OpenOptions::default().verify(false))
        .expect("malformed raster body must not fail the open");
    assert_eq!(opened.blocks().len(), 1);
    assert!(opened.blocks()[0].as_raster().is_none());
    assert_eq!(opened.blocks()[0].semantic(), BlockSemantic::RegularNDimGrid);

    // Same layout built in memory is refused by verification.
    let mut raster = RasterDataBlock::volume("volume", [1 << 40, 1 << 40, 1 << 40], 1 << 39, 0, 2);
    let mut target = Container::new(temp.path(), GlobalHeader::new(ChecksumScheme::None, Endian::Little));
    assert!(target.add_data_block(raster).is_err());
    assert!(target.blocks().is_empty());
}

#[test]
fn test_no_checksum_always_verifies() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_full_container(temp.path(), ChecksumScheme::None, Endian::Little);
    let mut bytes = std::fs::read(temp.path()).expect("Failed to read file");
    let last = bytes.len() - 1;
    bytes[last] ^= 0x20;
    std::fs::write(temp.path(), &bytes).expect("Failed to write file");
    Container::open(temp.path(), OpenOptions::default()).expect("no checksum means no verification");
}

#[test]
fn test_checksum_length_mismatch_is_distinct() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_full_container(temp.path(), ChecksumScheme::Crc32, Endian::Little);

    // Relabel the CRC32 file as MD5: stored 4 bytes, computed 16.
    let mut bytes = std::fs::read(temp.path()).expect("Failed to read file");
    bytes[17..25].copy_from_slice(&ChecksumScheme::Md5.tag().to_le_bytes());
    std::fs::write(temp.path(), &bytes).expect("Failed to write file");

    let err = Container::open(temp.path(), OpenOptions::default()).expect_err("length mismatch");
    assert!(
        matches!(err, Error::ChecksumLengthMismatch { stored: 4, computed: 16 }),
        "got {:?}",
        err
    );
}

#[test]
fn test_compressed_raster_roundtrip() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    let mut raster = test_volume(20, 8);
    raster.compression = CompressionScheme::Zlib;
    let source = raster.clone();

    let mut container = Container::new(temp.path(), GlobalHeader::new(ChecksumScheme::Crc32, Endian::Little));
    container.add_data_block(raster).expect("Failed to add raster");
    container.create().expect("Failed to write container");

    let uncompressed = {
        let flat = NamedTempFile::new().expect("Failed to create temp file");
        let mut plain = source.clone();
        plain.compression = CompressionScheme::None;
        let mut c = Container::new(flat.path(), GlobalHeader::default());
        c.add_data_block(plain).expect("Failed to add raster");
        c.create().expect("Failed to write container");
        std::fs::metadata(flat.path()).expect("metadata").len()
    };
    let compressed = std::fs::metadata(temp.path()).expect("metadata").len();
    assert!(compressed < uncompressed, "{} >= {}", compressed, uncompressed);

    let opened = Container::open(temp.path(), OpenOptions::default()).expect("Failed to open container");
    let stored = opened.blocks()[0].as_raster().expect("raster");
    assert_eq!(stored.compression, CompressionScheme::Zlib);
    assert_same_layout(&source, stored);
    assert_same_bricks(&source, stored);
}

#[test]
fn test_unknown_block_preserved() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    let payload: Vec<u8> = (0..=255).collect();
    let mut container = Container::new(temp.path(), GlobalHeader::new(ChecksumScheme::Md5, Endian::Little));
    container
        .add_data_block(OpaqueBlock::new("vendor", BlockSemantic::Unknown(77), payload.clone()))
        .expect("Failed to add opaque block");
    container.add_data_block(test_volume(8, 8)).expect("Failed to add raster");
    container.create().expect("Failed to write container");

    let opened = Container::open(temp.path(), OpenOptions::default()).expect("Failed to open container");
    match &opened.blocks()[0] {
        Block::Opaque(o) => {
            assert_eq!(o.semantic, BlockSemantic::Unknown(77));
            assert_eq!(o.data, payload);
        }
        other => panic!("expected opaque block, got {:?}", other.semantic()),
    }
    assert!(opened.blocks()[1].as_raster().is_some());

    // Re-writing carries the unknown block through unchanged.
    let copy = NamedTempFile::new().expect("Failed to create temp file");
    opened.write_to(copy.path()).expect("Failed to rewrite container");
    let reopened = Container::open(copy.path(), OpenOptions::default()).expect("Failed to reopen");
    match &reopened.blocks()[0] {
        Block::Opaque(o) => assert_eq!(o.data, payload),
        other => panic!("expected opaque block, got {:?}", other.semantic()),
    }
    assert_same_bricks(
        opened.blocks()[1].as_raster().expect("raster"),
        reopened.blocks()[1].as_raster().expect("raster"),
    );
}

#[test]
fn test_read_write_brick_update_keeps_checksum_valid() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    write_full_container(temp.path(), ChecksumScheme::Crc32, Endian::Little);

    let lod = [0u64];
    let brick = [1u64, 0, 0];
    let replacement = {
        let mut container = Container::open(temp.path(), OpenOptions::default().read_write(true))
            .expect("Failed to open read-write");
        assert!(container.is_read_write());
        let raster = container.block_mut(0).and_then(Block::as_raster_mut).expect("raster");
        let len = raster.get_data(&lod, &brick).expect("read brick").len();
        let replacement = vec![0xAB; len];
        raster.set_brick_data(&lod, &brick, &replacement).expect("Failed to write brick");
        container.close().expect("Failed to close");
        replacement
    };

    let opened = Container::open(temp.path(), OpenOptions::default()).expect("checksum must still verify");
    let raster = opened.blocks()[0].as_raster().expect("raster");
    assert_eq!(raster.get_data(&lod, &brick).expect("read brick"), replacement);
}

#[test]
fn test_rewrite_onto_source_file() {
    let temp = NamedTempFile::new().expect("Failed to create temp file");
    let source = write_full_container(temp.path(), ChecksumScheme::Crc32, Endian::Little);

    let mut opened = Container::open(temp.path(), OpenOptions::default()).expect("Failed to open");
    let mut kv = KeyValuePairDataBlock::new("notes");
    kv.add_pair("edited", "yes");
    opened.add_data_block(kv).expect("Failed to add block");
    opened.create().expect("Failed to rewrite in place");
    drop(opened);

    let reopened = Container::open(temp.path(), OpenOptions::default()).expect("Failed to reopen");
    assert_eq!(reopened.blocks().len(), 5);
    assert_same_bricks(&source, reopened.blocks()[0].as_raster().expect("raster"));
}

#[test]
fn test_open_errors() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let missing = dir.path().join("missing.uvf");
    assert!(matches!(
        Container::open(&missing, OpenOptions::default()),
        Err(Error::FileNotFound(_))
    ));

    // Valid header whose block chain runs off the end.
    let truncated = dir.path().join("truncated.uvf");
    write_full_container(&truncated, ChecksumScheme::None, Endian::Little);
    let bytes = std::fs::read(&truncated).expect("Failed to read file");
    std::fs::write(&truncated, &bytes[..bytes.len() * 2 / 3]).expect("Failed to truncate");
    let err = Container::open(&truncated, OpenOptions::default()).expect_err("truncated chain");
    assert_eq!(err.kind(), uvf::ErrorKind::Format);
}
