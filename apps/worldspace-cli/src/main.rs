use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glam::Vec3;
use tracing_subscriber::EnvFilter;
use worldspace_common::{Bounds, CellId, Identity, QueuedScheduler, Transform};
use worldspace_kernel::SpatialCell;
use worldspace_stream::{
    CellKind, LoggingCellCache, SpaceManager, StreamConfig, Universe, ViewCache, ViewSession,
};

#[derive(Parser)]
#[command(name = "worldspace-cli", about = "CLI tool for worldspace operations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML stream config; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate info and the effective stream config
    Info,
    /// List the spaces enclosing a sphere
    Spaces {
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        x: f32,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        y: f32,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        z: f32,
        #[arg(short, long, default_value = "10")]
        radius: f32,
    },
    /// Scatter cells, walk viewers through them, and report what each loaded
    Simulate {
        /// Number of root cells (each gets one child)
        #[arg(long, default_value = "200")]
        cells: usize,
        /// Number of viewers
        #[arg(long, default_value = "2")]
        viewers: usize,
        /// Steps each viewer walks along +x
        #[arg(long, default_value = "20")]
        steps: usize,
        /// Distance per step
        #[arg(long, default_value = "5")]
        stride: f32,
    },
}

struct Walker {
    name: String,
    view: SpatialCell,
    cache: Arc<ViewCache>,
    client: Arc<LoggingCellCache>,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<StreamConfig> {
    match path {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(StreamConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Info => {
            println!("worldspace-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("stream: {}", worldspace_stream::crate_info());
            println!("space_size: {}", config.space_size);
            println!("space_fudge: {}", config.space_fudge);
            println!("proximity_radius: {}", config.proximity_radius);
            println!("exit_grace_ms: {}", config.exit_grace_ms);
        }
        Commands::Spaces { x, y, z, radius } => {
            let spaces = SpaceManager::new(&config);
            let volume = Bounds::sphere(Vec3::new(x, y, z), radius);
            let mut keys: Vec<String> = spaces
                .enclosing_spaces(&volume)
                .iter()
                .map(|s| s.name().to_string())
                .collect();
            keys.sort();
            println!("{} space(s) enclose ({x}, {y}, {z}) r={radius}:", keys.len());
            for key in keys {
                println!("  {key}");
            }
        }
        Commands::Simulate {
            cells,
            viewers,
            steps,
            stride,
        } => simulate(config, cells, viewers, steps, stride)?,
    }

    Ok(())
}

fn simulate(
    config: StreamConfig,
    cells: usize,
    viewers: usize,
    steps: usize,
    stride: f32,
) -> anyhow::Result<()> {
    let _span = tracing::info_span!("simulate", cells, viewers, steps).entered();
    let scheduler = Arc::new(QueuedScheduler::new().context("starting task scheduler")?);
    let universe = Universe::new(config, scheduler)?;

    // Roots on a square lattice in the xz plane, 8 units apart.
    let side = (cells as f32).sqrt().ceil().max(1.0) as usize;
    for i in 0..cells {
        let position = Vec3::new((i % side) as f32 * 8.0, 0.0, (i / side) as f32 * 8.0);
        let root = universe.create_spatial_cell(CellId::new(), CellKind::Plain)?;
        let child = universe.create_spatial_cell(CellId::new(), CellKind::Plain)?;
        root.set_local_bounds(Bounds::sphere(Vec3::ZERO, 1.0))?;
        root.set_local_transform(Transform::from_position(position))?;
        child.set_local_bounds(Bounds::sphere(Vec3::ZERO, 0.5))?;
        child.set_local_transform(Transform::from_position(Vec3::new(0.0, 1.5, 0.0)))?;
        root.add_child(&child)?;
        universe.add_spatial_cell(root.id())?;
    }

    let mut walkers = Vec::with_capacity(viewers);
    for v in 0..viewers {
        let name = format!("viewer-{v}");
        let identity = Identity::new(name.clone());
        let view = universe.create_spatial_cell(CellId::new(), CellKind::View)?;
        view.set_local_bounds(Bounds::sphere(Vec3::ZERO, 0.5))?;
        view.set_local_transform(Transform::from_position(Vec3::new(0.0, 0.0, v as f32 * 16.0)))?;
        let client = Arc::new(LoggingCellCache::new(identity.clone()));
        let cache = universe.add_view_spatial_cell(view.id(), ViewSession::new(identity, client.clone()))?;
        universe.view_login(view.id())?;
        walkers.push(Walker {
            name,
            view,
            cache,
            client,
        });
    }

    for step in 1..=steps {
        for walker in &walkers {
            let mut position = walker.view.local_transform()?.position;
            position.x += stride;
            walker.view.set_local_transform(Transform::from_position(position))?;
        }
        tracing::debug!(step, "viewers moved");
    }

    println!(
        "{} cells in {} spaces, {} viewers, {steps} steps",
        universe.graph().len(),
        universe.spaces().space_count(),
        walkers.len()
    );
    for Walker {
        name,
        view,
        cache,
        client,
    } in &walkers
    {
        cache.flush()?;
        let stats = cache.stats();
        let spaces: Vec<String> = cache.spaces().iter().map(|c| c.to_string()).collect();
        println!(
            "{name}: at {:?}, watching [{}], {} roots, revalidations={} entered={} exited={} loaded={} unloaded={}",
            view.world_transform()?.position,
            spaces.join(", "),
            cache.root_count(),
            stats.revalidations,
            stats.spaces_entered,
            stats.spaces_exited,
            stats.cells_loaded,
            stats.cells_unloaded,
        );
        universe.view_logout(view.id());
        tracing::info!(viewer = %name, resident = client.resident(), "viewer done");
    }
    Ok(())
}
