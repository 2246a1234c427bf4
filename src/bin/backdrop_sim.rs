use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use rayon::prelude::*;

use backdrop::{
    BackdropError, BackdropOpts, BackdropStats, BackdropSystem, CompositeContext, DeviceBox, GroupAttrs, LayerId,
    LayerSpec, MemoryArena, RequestOutcome, Retention, SharedPageState,
};

#[derive(Parser, Debug)]
#[command(name = "backdrop-sim", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Composite a synthetic page band by band and print the page stats as JSON.
    Page(PageArgs),
    /// Print the effective cache options as JSON.
    Opts(OptsArgs),
}

#[derive(Parser, Debug)]
struct OptsArgs {
    /// Options JSON; missing fields take their defaults.
    #[arg(long)]
    opts: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct PageArgs {
    /// Options JSON; missing fields take their defaults.
    #[arg(long)]
    opts: Option<PathBuf>,

    /// Page width in pixels.
    #[arg(long, default_value_t = 1024)]
    width: u32,

    /// Page height in pixels.
    #[arg(long, default_value_t = 1024)]
    height: u32,

    /// Region height in pixels.
    #[arg(long, default_value_t = 64)]
    region_height: u32,

    /// Regions per band.
    #[arg(long, default_value_t = 4)]
    rows: u32,

    /// Worker threads; 1 composites single-threaded.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// What to keep once a region is composited; the page checksum needs `page`.
    #[arg(long, value_enum, default_value_t = RetentionChoice::Page)]
    retention: RetentionChoice,

    /// Memory limit in MiB; unlimited when absent.
    #[arg(long)]
    limit_mb: Option<usize>,

    /// Put a non-isolated group over the middle of the page.
    #[arg(long)]
    group: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RetentionChoice {
    None,
    Band,
    Page,
}

impl From<RetentionChoice> for Retention {
    fn from(c: RetentionChoice) -> Self {
        match c {
            RetentionChoice::None => Retention::None,
            RetentionChoice::Band => Retention::Band,
            RetentionChoice::Page => Retention::Page,
        }
    }
}

const CMYK: [i32; 4] = [0, 1, 2, 3];

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Page(args) => cmd_page(args),
        Command::Opts(args) => cmd_opts(args),
    }
}

fn read_opts(path: Option<&Path>) -> anyhow::Result<BackdropOpts> {
    let opts = match path {
        Some(p) => {
            let json = std::fs::read_to_string(p)
                .with_context(|| format!("read options '{}'", p.display()))?;
            BackdropOpts::from_json_str(&json)?
        }
        None => BackdropOpts::default(),
    };
    Ok(opts.with_env_overrides())
}

fn cmd_opts(args: OptsArgs) -> anyhow::Result<()> {
    let opts = read_opts(args.opts.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&opts)?);
    Ok(())
}

struct Layers {
    base: LayerId,
    group: Option<LayerId>,
}

fn cmd_page(args: PageArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.workers >= 1, "--workers must be >= 1");
    let mut opts = read_opts(args.opts.as_deref())?;
    opts.max_workers = opts.max_workers.max(args.workers);
    let arena = MemoryArena::new(args.limit_mb.map(|mb| mb << 20));
    let system = BackdropSystem::boot(opts, Arc::clone(&arena))?;

    let multi_threaded = args.workers > 1;
    let mut page = system.create_shared(
        args.width,
        args.height,
        args.region_height,
        args.rows,
        multi_threaded,
    )?;
    let depth = if args.group { 2 } else { 1 };
    page.provision_resources(CMYK.len(), args.group, depth)?;
    let layers = build_layers(&mut page, args.group)?;
    page.provision_resources(0, false, depth)?;
    page.prepare(Retention::from(args.retention), false)?;

    let geometry = *page.geometry();
    let bands = geometry.yblock.div_ceil(geometry.band_block_rows());
    if multi_threaded {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(args.workers)
            .build()
            .context("build worker pool")?;
        pool.install(|| {
            (0..bands)
                .into_par_iter()
                .try_for_each(|band| composite_band_with_new_context(&page, &layers, band, depth))
        })?;
    } else {
        let mut ctx = page.new_context(layers.base)?;
        for band in 0..bands {
            composite_band(&page, &mut ctx, &layers, band, depth)?;
        }
        page.release_context(ctx);
    }

    // only page retention keeps blocks past their band
    let retention = Retention::from(args.retention);
    let checksum = if retention == Retention::Page {
        Some(read_back(&page, layers.base)?)
    } else {
        None
    };
    let stats = page.destroy()?;
    print_report(&stats, checksum, arena.peak())?;
    system.shutdown();
    Ok(())
}

fn build_layers(page: &mut SharedPageState, group: bool) -> anyhow::Result<Layers> {
    let geometry = *page.geometry();
    let base = page.new_backdrop_layer(LayerSpec::new(
        0,
        GroupAttrs {
            composite_to_page: true,
            ..GroupAttrs::new(DeviceBox::from_size(geometry.width, geometry.height))
        },
        &CMYK,
        &CMYK,
    ))?;
    page.set_page_color(base, &[0; 4])?;

    let group = if group {
        let (w, h) = (geometry.width as i32, geometry.height as i32);
        let bounds = DeviceBox::new(w / 4, h / 4, w * 3 / 4 - 1, h * 3 / 4 - 1)?;
        Some(page.new_backdrop_layer(
            LayerSpec::new(1, GroupAttrs::new(bounds), &CMYK[..2], &CMYK[..2])
                .with_initial_backdrop(base)
                .with_parent(base),
        )?)
    } else {
        None
    };
    Ok(Layers { base, group })
}

fn composite_band_with_new_context(
    page: &SharedPageState,
    layers: &Layers,
    band: u32,
    depth: u32,
) -> anyhow::Result<()> {
    let mut ctx = page.new_context(layers.base)?;
    composite_band(page, &mut ctx, layers, band, depth)?;
    page.release_context(ctx);
    Ok(())
}

/// Composite every region of `band`: a tinted page background, then the group (if any) painted
/// over its inherited backdrop and merged back into the page layer.
fn composite_band(
    page: &SharedPageState,
    ctx: &mut CompositeContext,
    layers: &Layers,
    band: u32,
    depth: u32,
) -> anyhow::Result<()> {
    let g = page.geometry();
    let page_box = g.page_box();
    page.band_init(ctx)?;

    let first = band * g.region_rows_per_band;
    for r in first..first + g.region_rows_per_band {
        let y1 = (r * g.region_height) as i32;
        if y1 > page_box.y2 {
            break;
        }
        let y2 = (y1 + g.region_height as i32 - 1).min(page_box.y2);
        let area = DeviceBox::new(0, y1, page_box.x2, y2)?;
        if !page.region_requires_compositing(layers.base, area)? {
            continue;
        }
        match page.request_regions(ctx, depth, area)? {
            RequestOutcome::Fixed => {}
            other => anyhow::bail!("region {r} could not be pinned: {other:?}"),
        }

        page.region_init(ctx, layers.base, area)?;
        for y in y1..=y2 {
            let v = ((y * 7) % 256) as u16 * 257;
            page.write_span(ctx, layers.base, y, 0, page_box.x2, &[v, v / 2, 0, 0])?;
        }

        if let Some(group) = layers.group
            && let Some(gb) = area.intersect(page.layer(group)?.bounds())
        {
            page.region_init(ctx, group, area)?;
            for y in gb.y1..=gb.y2 {
                page.write_span(ctx, group, y, gb.x1, gb.x2, &[0, 0, 0, 0])?;
            }
            page.region_complete(ctx, group, area)?;
            for y in gb.y1..=gb.y2 {
                page.write_span(ctx, layers.base, y, gb.x1, gb.x2, &[0, 0, 0, 0])?;
            }
        }

        page.region_complete(ctx, layers.base, area)?;
        page.region_release_all(ctx, area, true)?;
    }

    page.band_release(ctx, true)?;
    Ok(())
}

/// Walk every block of the page layer and fold its first pixel into a checksum.
fn read_back(page: &SharedPageState, base: LayerId) -> anyhow::Result<u64> {
    let mut ctx = page.new_context(base)?;
    page.reader_init(&mut ctx, page.geometry().page_box())?;
    let mut checksum = 0u64;
    let mut missing = 0usize;
    loop {
        match page.reader_next(&mut ctx, base) {
            Ok(Some(block)) => {
                if let Some(px) = block.pixel(block.bounds.x1, block.bounds.y1) {
                    for c in px {
                        checksum = checksum.rotate_left(5) ^ u64::from(c);
                    }
                }
            }
            Ok(None) => break,
            // blocks dropped under memory pressure would need recompositing
            Err(BackdropError::Validation(_)) => missing += 1,
            Err(e) => return Err(e).context("read back the page layer"),
        }
    }
    page.release_context(ctx);
    if missing > 0 {
        eprintln!("{missing} blocks were not kept");
    }
    Ok(checksum)
}

fn print_report(
    stats: &BackdropStats,
    checksum: Option<u64>,
    peak_bytes: usize,
) -> anyhow::Result<()> {
    let report = serde_json::json!({
        "stats": stats,
        "checksum": checksum.map(|c| format!("{c:016x}")),
        "arena_peak_bytes": peak_bytes,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
