//! Horizon angles for a sun that moves along a single great circle through
//! the zenith. For every sample we look both ways along the sun's direction
//! of movement for the steepest occluder; the sample is in shadow whenever the
//! sun is lower than that angle on that side.

use std::f32::consts::FRAC_PI_2;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::SurfaceError;
use crate::terrain::surface::{HeightsSurface, ShadowSample, UberHeader};

/// Occluders further away than this many samples are ignored.
pub const MAX_SHADOW_DISTANCE: u32 = 1000;

const ANGLE_TO_SAMPLE: f32 = 65535.0 / FRAC_PI_2;

/// Calls `visit(s0, s1, alpha)` for every grid edge crossed by the segment
/// `p0 -> p1`, where the crossing sits `alpha` of the way from sample `s0`
/// to sample `s1`. The grid line through `p0` itself is not reported.
fn walk_grid_edges(
    p0: [f32; 2],
    p1: [f32; 2],
    limit: [u32; 2],
    mut visit: impl FnMut([u32; 2], [u32; 2], f32),
) {
    for axis in 0..2 {
        let other = 1 - axis;
        let delta = p1[axis] - p0[axis];
        if delta.abs() <= f32::EPSILON {
            continue;
        }
        let first = p0[axis].min(p1[axis]).ceil().max(0.0) as u32;
        let last = (p0[axis].max(p1[axis]).floor().max(0.0) as u32).min(limit[axis]);
        for line in first..=last {
            let t = (line as f32 - p0[axis]) / delta;
            if t <= 1e-6 {
                continue;
            }
            let along = p0[other] + t * (p1[other] - p0[other]);
            let base = along.floor().clamp(0.0, limit[other] as f32);
            let alpha = (along - base).clamp(0.0, 1.0);
            let base = base as u32;

            let mut s0 = [0; 2];
            s0[axis] = line;
            s0[other] = base;
            let mut s1 = s0;
            s1[other] = (base + 1).min(limit[other]);
            visit(s0, s1, alpha);
        }
    }
}

fn lerp(a: f32, b: f32, alpha: f32) -> f32 {
    a + (b - a) * alpha
}

/// Angle above the horizon, in radians, below which the sun moving along
/// `sun_direction_of_movement` is hidden from `sample`. Integer coordinates
/// are sample corners, matching the heights grid.
pub fn calculate_shadowing_angle(
    surface: &HeightsSurface,
    sample: [f32; 2],
    sample_height: f32,
    sun_direction_of_movement: [f32; 2],
    xy_scale: f32,
) -> f32 {
    if !surface.is_valid() {
        return FRAC_PI_2;
    }
    let limit = [surface.width() - 1, surface.height() - 1];
    let reach = MAX_SHADOW_DISTANCE.min(surface.width() + surface.height()) as f32;
    let mut end = [
        sample[0] + reach * sun_direction_of_movement[0],
        sample[1] + reach * sun_direction_of_movement[1],
    ];

    // clip the walk against the surface, one axis at a time
    for axis in 0..2 {
        let edge = if end[axis] < 0.0 {
            0.0
        } else if end[axis] > limit[axis] as f32 {
            limit[axis] as f32
        } else {
            continue;
        };
        let t = (edge - sample[axis]) / (end[axis] - sample[axis]);
        end = [lerp(sample[0], end[0], t), lerp(sample[1], end[1], t)];
        end[axis] = edge;
    }

    let mut smallest_tan = f32::MAX;
    walk_grid_edges(sample, end, limit, |s0, s1, alpha| {
        let h0 = surface.value(s0[0], s0[1]).unwrap_or(sample_height);
        let h1 = surface.value(s1[0], s1[1]).unwrap_or(sample_height);
        let height = lerp(h0, h1, alpha);
        let x = lerp(s0[0] as f32, s1[0] as f32, alpha) - sample[0];
        let y = lerp(s0[1] as f32, s1[1] as f32, alpha) - sample[1];
        let distance = (x * x + y * y).sqrt() * xy_scale;
        let tan_theta = distance / (height - sample_height).max(0.00001);
        smallest_tan = smallest_tan.min(tan_theta);
    });
    smallest_tan.atan()
}

fn quantize(angle: f32) -> u16 {
    (angle * ANGLE_TO_SAMPLE).clamp(0.0, 65535.0) as u16
}

/// Writes a shadowing surface the size of `surface`, one row at a time.
/// Samples outside `[interesting_mins, interesting_maxs)` are written as
/// [`ShadowSample::OPEN`].
pub fn build_shadowing_surface(
    surface: &HeightsSurface,
    destination: &Path,
    interesting_mins: [u32; 2],
    interesting_maxs: [u32; 2],
    sun_direction_of_movement: [f32; 2],
    xy_scale: f32,
) -> Result<(), SurfaceError> {
    let _span = tracing::trace_span!("build_shadowing_surface").entered();
    let (width, height) = (surface.width(), surface.height());
    let mut writer = BufWriter::new(File::create(destination)?);
    writer.write_all(bytemuck::bytes_of(&UberHeader::new(width, height)))?;

    let backwards = [-sun_direction_of_movement[0], -sun_direction_of_movement[1]];
    let columns = interesting_mins[0]..interesting_maxs[0].min(width);
    let mut line = vec![ShadowSample::OPEN; width as usize];
    for y in 0..height {
        line.fill(ShadowSample::OPEN);
        if (interesting_mins[1]..interesting_maxs[1]).contains(&y) {
            for x in columns.clone() {
                let point = [x as f32, y as f32];
                let sample_height = surface.value(x, y).unwrap_or_default();
                let a0 = calculate_shadowing_angle(surface, point, sample_height, backwards, xy_scale);
                let a1 = calculate_shadowing_angle(
                    surface,
                    point,
                    sample_height,
                    sun_direction_of_movement,
                    xy_scale,
                );
                line[x as usize] = ShadowSample::new(quantize(a0), quantize(a1));
            }
        }
        writer.write_all(bytemuck::cast_slice(&line))?;
    }
    writer.flush()?;
    log::debug!(
        "wrote shadowing surface {} ({}x{})",
        destination.display(),
        width,
        height
    );
    Ok(())
}
