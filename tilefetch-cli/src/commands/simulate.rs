//! Simulate command - run a random workload through the scheduler.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use tilefetch::tile::{num_resolution_levels, num_tiles_x, num_tiles_y, tile_region};
use tilefetch::{
    ChannelSink, FetchSpec, GeoPoint, RequestHandle, RequestId, ResultSink, Scheduler,
    SchedulerConfig, TileEvent, TileSource,
};

use crate::error::CliError;
use crate::synthetic::SyntheticSource;

/// Native size of the synthetic raster (level 0).
const RASTER_SIZE: u64 = 1 << 18;

/// Tile edge length in pixels.
const TILE_SIZE: u32 = 256;

/// Number of serviced requests listed in the report.
const REPORT_ROWS: usize = 20;

/// A `LAT,LON` pair given on the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewpoint {
    pub lat: f64,
    pub lon: f64,
}

impl FromStr for Viewpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, lon) = s
            .split_once(',')
            .ok_or_else(|| format!("expected LAT,LON, got '{}'", s))?;
        let lat: f64 = lat
            .trim()
            .parse()
            .map_err(|e| format!("invalid latitude '{}': {}", lat, e))?;
        let lon: f64 = lon
            .trim()
            .parse()
            .map_err(|e| format!("invalid longitude '{}': {}", lon, e))?;

        if !GeoPoint::new(lat, lon).is_valid() {
            return Err(format!("coordinates out of range: {},{}", lat, lon));
        }
        Ok(Self { lat, lon })
    }
}

impl From<Viewpoint> for GeoPoint {
    fn from(viewpoint: Viewpoint) -> Self {
        GeoPoint::new(viewpoint.lat, viewpoint.lon)
    }
}

/// Arguments for the simulate command.
#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Number of requests to submit
    #[arg(long, default_value_t = 200)]
    pub requests: usize,

    /// Fraction of requests submitted as prefetch (0.0 - 1.0)
    #[arg(long, default_value_t = 0.2)]
    pub prefetch_ratio: f64,

    /// Simulated decode time per unit of cost, in milliseconds
    #[arg(long, default_value_t = 2)]
    pub decode_ms: u64,

    /// Viewpoint used for geographic ordering, as LAT,LON
    #[arg(long, value_name = "LAT,LON")]
    pub viewpoint: Option<Viewpoint>,

    /// Fraction of requests cancelled right after submission (0.0 - 1.0)
    #[arg(long, default_value_t = 0.1)]
    pub cancel_ratio: f64,

    /// Seed for the workload generator (random if omitted)
    #[arg(long)]
    pub seed: Option<u64>,
}

impl SimulateArgs {
    fn validate(&self) -> Result<(), CliError> {
        for (name, value) in [
            ("--prefetch-ratio", self.prefetch_ratio),
            ("--cancel-ratio", self.cancel_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CliError::InvalidArgument(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// What the report needs to know about each submitted request.
#[derive(Debug, Clone, Copy)]
struct Submitted {
    level: u32,
    prefetch: bool,
    cost: f64,
    subsample: f64,
}

/// Run the simulate command.
pub fn run(args: SimulateArgs) -> Result<(), CliError> {
    args.validate()?;

    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    let source = Arc::new(SyntheticSource::new(
        RASTER_SIZE,
        TILE_SIZE,
        Duration::from_millis(args.decode_ms),
    ));

    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default())?);
    if let Some(viewpoint) = args.viewpoint {
        scheduler.set_viewpoint(viewpoint.into());
    }

    let handler_scheduler = Arc::clone(&scheduler);
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received interrupt, cancelling outstanding requests...");
        handler_scheduler.shutdown();
    })?;

    println!("Simulating {} requests (seed {})", args.requests, seed);
    println!(
        "  Raster:    {} x {} px, {} px tiles, {} levels",
        RASTER_SIZE,
        RASTER_SIZE,
        TILE_SIZE,
        num_resolution_levels(source.as_ref())
    );
    match args.viewpoint {
        Some(viewpoint) => println!("  Viewpoint: {:.4},{:.4}", viewpoint.lat, viewpoint.lon),
        None => println!("  Viewpoint: none"),
    }
    println!();

    let (sink, mut events) = ChannelSink::new();
    let sink = Arc::new(sink);

    let specs: Vec<(u32, FetchSpec)> = (0..args.requests)
        .map(|_| random_spec(&mut rng, &source, &sink, args.prefetch_ratio))
        .collect();
    let levels: Vec<u32> = specs.iter().map(|(level, _)| *level).collect();

    let started_at = Instant::now();
    let handles = scheduler.submit_all(specs.into_iter().map(|(_, spec)| spec))?;
    let submitted: HashMap<RequestId, Submitted> = handles
        .iter()
        .zip(levels)
        .map(|(handle, level)| (handle.id(), describe(handle, level)))
        .collect();
    info!(requests = handles.len(), "Workload submitted");

    let mut canceled_by_user = 0usize;
    for handle in &handles {
        if rng.random_bool(args.cancel_ratio) {
            handle.cancel();
            canceled_by_user += 1;
        }
    }
    debug!(canceled_by_user, "Random cancellations issued");

    // Requests keep the sink alive, so count terminal events rather than
    // waiting for the channel to close
    let progress = progress_bar(handles.len() as u64);
    let mut start_order = Vec::with_capacity(handles.len());
    let mut outcomes = Outcomes::default();
    while outcomes.total() < handles.len() {
        let Some(event) = events.blocking_recv() else {
            break;
        };
        match event {
            TileEvent::Started(id) => start_order.push(id),
            TileEvent::Update(..) => outcomes.updates += 1,
            TileEvent::Completed(_) => outcomes.completed += 1,
            TileEvent::Canceled(_) => outcomes.canceled += 1,
            TileEvent::Failed(id, message) => {
                outcomes.failed += 1;
                progress.println(format!("Request {} failed: {}", id, message));
            }
        }
        progress.set_position(outcomes.total() as u64);
    }
    progress.finish_and_clear();
    let elapsed = started_at.elapsed();

    let metrics = scheduler.metrics();
    scheduler.shutdown();

    print_report(&start_order, &submitted);
    println!();
    println!("Outcomes ({:.2}s)", elapsed.as_secs_f64());
    println!("  Completed: {}", outcomes.completed);
    println!("  Canceled:  {} ({} by request)", outcomes.canceled, canceled_by_user);
    println!("  Failed:    {}", outcomes.failed);
    println!("  Updates:   {}", outcomes.updates);
    println!();
    println!("Metrics: {}", metrics);

    Ok(())
}

#[derive(Debug, Default)]
struct Outcomes {
    completed: usize,
    canceled: usize,
    failed: usize,
    updates: usize,
}

impl Outcomes {
    fn total(&self) -> usize {
        self.completed + self.canceled + self.failed
    }
}

/// Builds a request for a random tile at a random level of the source's
/// pyramid. Higher levels are coarser overviews.
fn random_spec(
    rng: &mut StdRng,
    source: &Arc<SyntheticSource>,
    sink: &Arc<ChannelSink>,
    prefetch_ratio: f64,
) -> (u32, FetchSpec) {
    let level = rng.random_range(0..num_resolution_levels(source.as_ref()));
    let column = rng.random_range(0..num_tiles_x(source.as_ref(), level));
    let row = rng.random_range(0..num_tiles_y(source.as_ref(), level));
    let bounds = source.envelope(&tile_region(source.as_ref(), level, column, row));

    let spec = FetchSpec::tile(
        Arc::clone(source) as Arc<dyn TileSource>,
        level,
        column,
        row,
        Arc::clone(sink) as Arc<dyn ResultSink>,
    )
    .with_bounds(bounds)
    .prefetch(rng.random_bool(prefetch_ratio));

    (level, spec)
}

fn describe(handle: &RequestHandle, level: u32) -> Submitted {
    Submitted {
        level,
        prefetch: handle.is_prefetch(),
        cost: handle.cost(),
        subsample: handle.subsample(),
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let progress = ProgressBar::new(len);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} finished")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    progress
}

fn print_report(start_order: &[RequestId], submitted: &HashMap<RequestId, Submitted>) {
    println!(
        "Service order (first {} of {} started)",
        REPORT_ROWS.min(start_order.len()),
        start_order.len()
    );
    println!("  {:>6}  {:>5}  {:>8}  {:>9}  {}", "id", "level", "cost", "subsample", "class");
    for id in start_order.iter().take(REPORT_ROWS) {
        let Some(info) = submitted.get(id) else {
            continue;
        };
        println!(
            "  {:>6}  {:>5}  {:>8}  {:>9}  {}",
            id,
            info.level,
            info.cost,
            info.subsample,
            if info.prefetch { "prefetch" } else { "visible" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_viewpoint() {
        let viewpoint: Viewpoint = "53.55, 9.99".parse().unwrap();
        assert_eq!(viewpoint, Viewpoint { lat: 53.55, lon: 9.99 });
        assert_eq!(GeoPoint::from(viewpoint), GeoPoint::new(53.55, 9.99));
    }

    #[test]
    fn test_parse_viewpoint_errors() {
        assert!("53.55".parse::<Viewpoint>().is_err());
        assert!("north,east".parse::<Viewpoint>().is_err());
        assert!("95.0,10.0".parse::<Viewpoint>().is_err());
    }

    #[test]
    fn test_validate_ratios() {
        let args = SimulateArgs {
            requests: 1,
            prefetch_ratio: 1.5,
            decode_ms: 0,
            viewpoint: None,
            cancel_ratio: 0.0,
            seed: None,
        };
        assert!(matches!(args.validate(), Err(CliError::InvalidArgument(_))));
    }

    #[test]
    fn test_random_spec_stays_in_grid() {
        let mut rng = StdRng::seed_from_u64(1);
        let source = Arc::new(SyntheticSource::new(RASTER_SIZE, TILE_SIZE, Duration::ZERO));
        let (sink, _events) = ChannelSink::new();
        let sink = Arc::new(sink);

        let levels = num_resolution_levels(source.as_ref());
        assert_eq!(levels, 11);

        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        for _ in 0..50 {
            let (level, spec) = random_spec(&mut rng, &source, &sink, 0.5);
            assert!(level < levels);
            let handle = scheduler.submit(spec).unwrap();
            assert!(!handle.region().is_empty());
        }
        scheduler.shutdown();
    }
}
