//! uvf-cli - inspect, synthesise and stream UVF volume containers.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use uvf::cache::{BrickCache, HeadlessBackend, HeadlessTexture};
use uvf::config::{parse_bytes, StreamingConfig};
use uvf::dataset::VolumeDataset;
use uvf::render::{BrickDraw, ProgressiveScheduler, RenderSink, SystemClock};
use uvf::store::Endian;
use uvf::util::Coords;
use uvf::uvf::{
    checksum, Block, ChecksumScheme, CompressionScheme, Container, ElementSemantic, GlobalHeader,
    Histogram1DDataBlock, Histogram2DDataBlock, KeyValuePairDataBlock, OpenOptions, RasterDataBlock,
};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("UVF_BUILD_DATE"), ")");

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "uvf-cli", about = "Inspect, create and stream UVF volume containers", version = VERSION)]
struct Cli {
    /// More output (-v debug, -vv trace); UVF_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Streaming settings (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print header, checksum state and block summaries
    Info {
        file: PathBuf,
        /// Skip whole-file checksum verification
        #[arg(long)]
        no_verify: bool,
        /// Print the non-empty bins of the 1-D histogram
        #[arg(long)]
        hist1d: bool,
        /// Print per-intensity totals of the 2-D histogram
        #[arg(long)]
        hist2d: bool,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Write a synthetic sphere volume with LOD pyramid and histograms
    Create {
        file: PathBuf,
        /// Domain size
        #[arg(long, num_args = 3, value_names = ["X", "Y", "Z"], default_values_t = [64u64, 64, 64])]
        size: Vec<u64>,
        /// Bits per voxel: 8 or 16
        #[arg(long, default_value_t = 8)]
        bits: u64,
        #[arg(long, default_value_t = 32)]
        brick_size: u64,
        /// Halo voxels on each brick side
        #[arg(long, default_value_t = 1)]
        overlap: u64,
        #[arg(long, value_enum, default_value_t = ChecksumArg::Crc32)]
        checksum: ChecksumArg,
        /// Store the raster payload zlib compressed
        #[arg(long)]
        compress: bool,
        #[arg(long)]
        big_endian: bool,
    },
    /// Stream a frame through the scheduler against a counting texture backend
    Render {
        file: PathBuf,
        /// LOD level (0 = finest); defaults to the finest level
        #[arg(long)]
        lod: Option<u64>,
        /// Cache budget, with optional K/M/G suffix
        #[arg(long)]
        budget: Option<String>,
        /// Time slice in milliseconds
        #[arg(long)]
        slice_ms: Option<u64>,
        /// Frames to render back to back
        #[arg(long, default_value_t = 1)]
        frames: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ChecksumArg {
    None,
    Crc32,
    Md5,
}

impl From<ChecksumArg> for ChecksumScheme {
    fn from(arg: ChecksumArg) -> Self {
        match arg {
            ChecksumArg::None => ChecksumScheme::None,
            ChecksumArg::Crc32 => ChecksumScheme::Crc32,
            ChecksumArg::Md5 => ChecksumScheme::Md5,
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8, quiet: bool) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "uvf=debug,info",
        (false, _) => "uvf=trace,debug",
    };
    let filter = EnvFilter::try_from_env("UVF_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StreamingConfig> {
    let base = match path {
        Some(p) => StreamingConfig::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => StreamingConfig::default(),
    };
    Ok(base.with_overrides(|key| std::env::var(key).ok())?)
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

// ── info ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct InfoReport {
    path: PathBuf,
    version: u64,
    endian: &'static str,
    checksum_scheme: String,
    checksum: String,
    verified: bool,
    blocks: Vec<BlockInfo>,
}

#[derive(Serialize)]
struct BlockInfo {
    id: String,
    semantic: String,
    compression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    raster: Option<RasterInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    histogram_1d: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    histogram_2d: Option<Hist2dInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairs: Option<Vec<(String, String)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    opaque_bytes: Option<usize>,
}

#[derive(Serialize)]
struct RasterInfo {
    domain: Vec<u64>,
    brick: Vec<u64>,
    overlap: Vec<u64>,
    decimation: Vec<u64>,
    element: Vec<String>,
    payload_bytes: u64,
    levels: Vec<LevelInfo>,
}

#[derive(Serialize)]
struct LevelInfo {
    lod: Vec<u64>,
    domain: Vec<u64>,
    bricks: Vec<u64>,
    bytes: u64,
}

#[derive(Serialize)]
struct Hist2dInfo {
    intensity_bins: usize,
    gradient_bins: usize,
    max_gradient: f64,
    total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    row_totals: Option<Vec<u64>>,
}

fn raster_info(raster: &RasterDataBlock) -> anyhow::Result<RasterInfo> {
    let levels = raster
        .lod_permutations()
        .into_iter()
        .map(|lod| {
            Ok(LevelInfo {
                domain: raster.lod_domain_size(&lod)?.to_vec(),
                bricks: raster.brick_count(&lod)?.to_vec(),
                bytes: raster.lod_byte_size(&lod)?,
                lod: lod.to_vec(),
            })
        })
        .collect::<uvf::Result<Vec<_>>>()?;
    Ok(RasterInfo {
        domain: raster.domain_size.to_vec(),
        brick: raster.brick_size.to_vec(),
        overlap: raster.brick_overlap.to_vec(),
        decimation: raster.lod_dec_factor.to_vec(),
        element: raster
            .components()
            .map(|c| match c.scalar_type() {
                Some(ty) => format!("{} {}", c.semantic, ty),
                None => format!("{} {}-bit", c.semantic, c.bit_size),
            })
            .collect(),
        payload_bytes: raster.data_size()?,
        levels,
    })
}

fn block_info(block: &Block, hist2d: bool) -> anyhow::Result<BlockInfo> {
    let mut info = BlockInfo {
        id: block.id().to_string(),
        semantic: block.semantic().to_string(),
        compression: block.compression().to_string(),
        raster: None,
        histogram_1d: None,
        histogram_2d: None,
        pairs: None,
        opaque_bytes: None,
    };
    match block {
        Block::Raster(r) => info.raster = Some(raster_info(r)?),
        Block::Histogram1D(h) => {
            info.histogram_1d = Some(h.bins().to_vec());
        }
        Block::Histogram2D(h) => {
            info.histogram_2d = Some(Hist2dInfo {
                intensity_bins: h.intensity_bins(),
                gradient_bins: h.gradient_bins(),
                max_gradient: h.max_gradient(),
                total: h.total(),
                row_totals: hist2d.then(|| {
                    (0..h.intensity_bins())
                        .map(|i| h.row(i).map_or(0, |row| row.iter().sum()))
                        .collect()
                }),
            });
        }
        Block::KeyValue(kv) => info.pairs = Some(kv.pairs().to_vec()),
        Block::Opaque(o) => info.opaque_bytes = Some(o.data.len()),
    }
    Ok(info)
}

fn run_info(
    file: &Path,
    config: &StreamingConfig,
    verify: bool,
    hist1d: bool,
    hist2d: bool,
    json: bool,
) -> anyhow::Result<()> {
    let verify = verify && config.verify_checksum;
    let options = OpenOptions::default().verify(verify).use_mmap(config.use_mmap);
    let container = Container::open(file, options).with_context(|| format!("opening {}", file.display()))?;
    let header = container.header();

    let report = InfoReport {
        path: file.to_path_buf(),
        version: header.version,
        endian: header.endian.name(),
        checksum_scheme: header.checksum_scheme.to_string(),
        checksum: checksum::to_hex(&header.checksum),
        verified: verify && header.checksum_scheme != ChecksumScheme::None,
        blocks: container
            .blocks()
            .iter()
            .map(|b| block_info(b, hist2d))
            .collect::<anyhow::Result<_>>()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("File:      {}", report.path.display());
    println!("Version:   {}", report.version);
    println!("Endian:    {}", report.endian);
    println!(
        "Checksum:  {} {} ({})",
        report.checksum_scheme,
        report.checksum,
        if report.verified { "verified" } else { "not verified" }
    );
    println!("Blocks:    {}", report.blocks.len());
    for (i, b) in report.blocks.iter().enumerate() {
        println!();
        println!("[{}] '{}' {} (compression: {})", i, b.id, b.semantic, b.compression);
        if let Some(r) = &b.raster {
            println!("    domain {:?} brick {:?} overlap {:?} dec {:?}", r.domain, r.brick, r.overlap, r.decimation);
            println!("    element [{}]  payload {}", r.element.join(", "), human_bytes(r.payload_bytes));
            for level in &r.levels {
                println!(
                    "    LOD {:?}: {:?} voxels, {:?} bricks, {}",
                    level.lod,
                    level.domain,
                    level.bricks,
                    human_bytes(level.bytes)
                );
            }
        }
        if let Some(bins) = &b.histogram_1d {
            if hist1d {
                for (value, count) in bins.iter().enumerate().filter(|(_, &c)| c > 0) {
                    println!("    {:>6}: {}", value, count);
                }
            } else {
                println!("    filled to {} bins", bins.len());
            }
        }
        if let Some(h) = &b.histogram_2d {
            println!(
                "    {} x {} bins, max gradient {:.4}, {} samples",
                h.intensity_bins, h.gradient_bins, h.max_gradient, h.total
            );
            if let Some(rows) = &h.row_totals {
                for (value, total) in rows.iter().enumerate().filter(|(_, &t)| t > 0) {
                    println!("    {:>6}: {}", value, total);
                }
            }
        }
        if let Some(pairs) = &b.pairs {
            for (k, v) in pairs {
                println!("    {} = {}", k, v);
            }
        }
        if let Some(n) = b.opaque_bytes {
            println!("    {} opaque", human_bytes(n as u64));
        }
    }
    Ok(())
}

// ── create ─────────────────────────────────────────────────────────────────

/// Radial falloff: 1 at the centre, 0 at and beyond the inscribed sphere.
fn sphere_volume(size: [u64; 3], bits: u64) -> Vec<u8> {
    let max = ((1u64 << bits) - 1) as f64;
    let center = glam::DVec3::new(size[0] as f64, size[1] as f64, size[2] as f64) * 0.5;
    let radius = center.min_element().max(1.0);
    let bytes = (bits / 8) as usize;
    let mut out = Vec::with_capacity((size[0] * size[1] * size[2]) as usize * bytes);
    for z in 0..size[2] {
        for y in 0..size[1] {
            for x in 0..size[0] {
                let p = glam::DVec3::new(x as f64 + 0.5, y as f64 + 0.5, z as f64 + 0.5);
                let v = ((1.0 - p.distance(center) / radius).clamp(0.0, 1.0) * max).round() as u64;
                out.extend_from_slice(&v.to_le_bytes()[..bytes]);
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn run_create(
    file: &Path,
    size: &[u64],
    bits: u64,
    brick_size: u64,
    overlap: u64,
    checksum: ChecksumScheme,
    compress: bool,
    big_endian: bool,
) -> anyhow::Result<()> {
    let size: [u64; 3] = size.try_into().context("--size takes three values")?;
    anyhow::ensure!(size.iter().all(|&n| n > 0), "--size values must be positive");
    anyhow::ensure!(bits == 8 || bits == 16, "--bits must be 8 or 16");
    anyhow::ensure!(brick_size > 2 * overlap, "--brick-size must exceed twice the overlap");

    let start = Instant::now();
    let mut raster = RasterDataBlock::volume("volume", size, brick_size, overlap, 2);
    if bits == 16 {
        raster.set_type_to_ushort(ElementSemantic::Intensity);
    }
    if compress {
        raster.compression = CompressionScheme::Zlib;
    }
    raster.build_from_flat_data(&sphere_volume(size, bits))?;

    let mut hist1d = Histogram1DDataBlock::new("histogram 1D");
    hist1d.compute(&raster)?;
    let mut hist2d = Histogram2DDataBlock::new("histogram 2D");
    if let Err(e) = hist2d.compute(&raster) {
        tracing::warn!(error = %e, "skipping 2-D histogram");
    }

    let mut meta = KeyValuePairDataBlock::with_writer_info("metadata");
    meta.add_pair("source", format!("synthetic sphere {}x{}x{}", size[0], size[1], size[2]));

    let endian = if big_endian { Endian::Big } else { Endian::Little };
    let mut container = Container::new(file, GlobalHeader::new(checksum, endian));
    let lods = raster.lod_permutations().len();
    container.add_data_block(raster)?;
    container.add_data_block(hist1d)?;
    if hist2d.intensity_bins() > 0 {
        container.add_data_block(hist2d)?;
    }
    container.add_data_block(meta)?;
    container.create().with_context(|| format!("writing {}", file.display()))?;

    let written = std::fs::metadata(file)?.len();
    println!(
        "Wrote {} ({}, {} LOD levels, {} blocks) in {:.2?}",
        file.display(),
        human_bytes(written),
        lods,
        container.blocks().len(),
        start.elapsed()
    );
    Ok(())
}

// ── render ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct CountingSink {
    drawn: u64,
    substituted: u64,
    voxels: u64,
}

impl RenderSink<HeadlessTexture> for CountingSink {
    fn draw_brick(&mut self, draw: &BrickDraw<'_>, texture: &HeadlessTexture) -> uvf::Result<()> {
        self.drawn += 1;
        if draw.is_substitute() {
            self.substituted += 1;
        }
        self.voxels += texture.desc.voxel_count();
        Ok(())
    }
}

fn run_render(
    file: &Path,
    mut config: StreamingConfig,
    lod: Option<u64>,
    budget: Option<&str>,
    slice_ms: Option<u64>,
    frames: u32,
) -> anyhow::Result<()> {
    if let Some(b) = budget {
        config.cache_budget_bytes = parse_bytes(b)?;
    }
    if let Some(ms) = slice_ms {
        config.time_slice_ms = ms;
    }
    config.validate()?;

    let dataset = VolumeDataset::open(file, &config).with_context(|| format!("opening {}", file.display()))?;
    let volume = dataset.volume();
    let level: Coords = match lod {
        Some(n) => volume.lod_level_count.iter().map(|&count| n.min(count.saturating_sub(1))).collect(),
        None => volume.finest_lod(),
    };
    let bricks = dataset.brick_list(&level)?;
    println!(
        "Rendering LOD {:?}: {} bricks, budget {}, slice {} ms",
        level.as_slice(),
        bricks.len(),
        human_bytes(config.cache_budget_bytes),
        config.time_slice_ms
    );

    let mut cache = BrickCache::new(HeadlessBackend::new(), config.cache_budget_bytes);
    let mut scheduler = ProgressiveScheduler::from_config(&config);
    let clock = SystemClock::new();

    for _ in 0..frames {
        let mut sink = CountingSink::default();
        let frame = scheduler.begin_frame(bricks.clone());
        let start = Instant::now();
        while scheduler.needs_redraw() {
            let report = scheduler.advance(&mut cache, &dataset, &mut sink, &clock);
            if report.stalled {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        let progress = scheduler.progress();
        let stats = cache.stats();
        println!(
            "frame {}: {} slices, {} drawn ({} coarser), {} skipped, {} voxels, {:.2?}",
            frame,
            progress.slices,
            sink.drawn,
            sink.substituted,
            progress.skipped,
            sink.voxels,
            start.elapsed()
        );
        println!(
            "  cache: {} hits, {} misses, {} evictions, {} resident in {} entries",
            stats.hits,
            stats.misses,
            stats.evictions,
            human_bytes(stats.resident_bytes),
            stats.entries
        );
    }
    Ok(())
}

// ── main ───────────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info { file, no_verify, hist1d, hist2d, json } => {
            run_info(&file, &config, !no_verify, hist1d, hist2d, json)
        }
        Commands::Create { file, size, bits, brick_size, overlap, checksum, compress, big_endian } => {
            run_create(&file, &size, bits, brick_size, overlap, checksum.into(), compress, big_endian)
        }
        Commands::Render { file, lod, budget, slice_ms, frames } => {
            run_render(&file, config, lod, budget.as_deref(), slice_ms, frames)
        }
    }
}
