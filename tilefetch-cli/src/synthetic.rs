//! Synthetic raster source for simulations.
//!
//! Covers the Web Mercator latitude band with a square raster. Decodes sleep
//! in proportion to the request's cost and poll for cancellation while they
//! do, which is enough to observe the scheduler's ordering without any real
//! imagery.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tilefetch::{DecodeContext, DecodeError, Envelope, ReadRegion, TileSource};

/// Latitude limit of the synthetic raster.
pub const MAX_LATITUDE: f64 = 85.0511;

/// Costs above this all take the same time to decode.
const MAX_COST_FACTOR: u64 = 16;

/// Polling step for cancellation while "decoding".
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A raster that produces flat-colored tiles after a simulated delay.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    size: u64,
    tile_size: u32,
    decode_time: Duration,
}

impl SyntheticSource {
    /// Creates a square `size` x `size` raster with square tiles.
    pub fn new(size: u64, tile_size: u32, decode_time: Duration) -> Self {
        Self {
            size,
            tile_size,
            decode_time,
        }
    }

    /// Geographic bounds of a source rectangle.
    pub fn envelope(&self, region: &ReadRegion) -> Envelope {
        let size = self.size as f64;
        let lon = |x: u64| -180.0 + (x.min(self.size) as f64 / size) * 360.0;
        let lat = |y: u64| MAX_LATITUDE - (y.min(self.size) as f64 / size) * 2.0 * MAX_LATITUDE;

        Envelope::new(
            lon(region.src_x),
            lat(region.src_y.saturating_add(region.src_height)),
            lon(region.src_x.saturating_add(region.src_width)),
            lat(region.src_y),
        )
    }

    /// Simulated decode time for a region.
    fn decode_time_for(&self, region: &ReadRegion) -> Duration {
        let pixels = region.src_width.saturating_mul(region.src_height);
        let output = u64::from(region.dst_width) * u64::from(region.dst_height);
        let factor = (pixels / output.max(1)).clamp(1, MAX_COST_FACTOR);
        self.decode_time * factor as u32
    }
}

impl TileSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn native_width(&self) -> u64 {
        self.size
    }

    fn native_height(&self) -> u64 {
        self.size
    }

    fn tile_width(&self) -> u32 {
        self.tile_size
    }

    fn tile_height(&self) -> u32 {
        self.tile_size
    }

    fn decode(&self, region: &ReadRegion, ctx: &mut DecodeContext<'_>) -> Result<Bytes, DecodeError> {
        let mut remaining = self.decode_time_for(region);
        while !remaining.is_zero() {
            ctx.check_cancelled()?;
            let step = remaining.min(POLL_INTERVAL);
            thread::sleep(step);
            remaining -= step;
        }

        let len = region.dst_width as usize * region.dst_height as usize;
        let shade = (ctx.request_id() % 251) as u8;
        Ok(Bytes::from(vec![shade; len]))
    }
}
