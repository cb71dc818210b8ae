use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use worldspace_common::{Bounds, CellId, Identity, InlineScheduler, Transform};
use worldspace_stream::{CellKind, LoggingCellCache, SpaceManager, StreamConfig, Universe, ViewSession};

fn bench_enclosing_spaces(radius: f32, iterations: usize) {
    let spaces = SpaceManager::new(&StreamConfig::default());
    let start = Instant::now();
    for i in 0..iterations {
        let center = Vec3::new((i % 200) as f32 * 7.5, 0.0, (i / 200 % 200) as f32 * 7.5);
        let _ = black_box(spaces.enclosing_spaces(black_box(&Bounds::sphere(center, radius))));
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / iterations as u32;
    println!(
        "  enclosing_spaces (r={radius}, {iterations} iters, {} spaces): {per_iter:?}/iter, total {elapsed:?}",
        spaces.space_count()
    );
}

fn populated_universe(cell_count: usize, spacing: f32) -> Universe {
    let universe = Universe::new(StreamConfig::default(), Arc::new(InlineScheduler))
        .expect("default config is valid");
    let side = (cell_count as f32).sqrt().ceil() as usize;
    for i in 0..cell_count {
        let position = Vec3::new((i % side) as f32 * spacing, 0.0, (i / side) as f32 * spacing);
        let cell = universe
            .create_spatial_cell(CellId::new(), CellKind::Plain)
            .expect("fresh id");
        cell.set_local_bounds(Bounds::sphere(Vec3::ZERO, 1.0))
            .expect("cell exists");
        cell.set_local_transform(Transform::from_position(position))
            .expect("cell exists");
        universe.add_spatial_cell(cell.id()).expect("cell is a root");
    }
    universe
}

fn bench_viewer_walk(cell_count: usize, steps: usize) {
    let universe = populated_universe(cell_count, 8.0);
    let view = universe
        .create_spatial_cell(CellId::new(), CellKind::View)
        .expect("fresh id");
    let client = Arc::new(LoggingCellCache::new(Identity::new("bench")));
    let session = ViewSession::new(Identity::new("bench"), client.clone());
    let cache = universe
        .add_view_spatial_cell(view.id(), session)
        .expect("view cell");
    cache.login().expect("worker starts");
    cache.flush().expect("worker running");

    let start = Instant::now();
    for step in 0..steps {
        let x = step as f32 * 10.0;
        view.set_local_transform(Transform::from_position(Vec3::new(x, 0.0, 0.0)))
            .expect("view exists");
        cache.flush().expect("worker running");
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / steps as u32;
    let stats = cache.stats();
    println!(
        "  viewer walk ({cell_count} cells, {steps} steps, {} revalidations, {} cells loaded): {per_iter:?}/step, total {elapsed:?}",
        stats.revalidations, stats.cells_loaded
    );
    cache.logout();
}

fn main() {
    println!("=== Space Lookup Benchmarks ===\n");

    println!("Enclosing spaces:");
    bench_enclosing_spaces(1.0, 100_000);
    bench_enclosing_spaces(10.0, 100_000);
    bench_enclosing_spaces(60.0, 10_000);

    println!("\nViewer walk (revalidate + load/unload):");
    bench_viewer_walk(100, 100);
    bench_viewer_walk(1000, 100);
    bench_viewer_walk(10000, 50);

    println!("\n=== Done ===");
}
