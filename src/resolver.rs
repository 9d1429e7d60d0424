//! Track geometry resolution: GPS position → linear milepost.
//!
//! A subdivision's reference points are a sparse sampling of its track
//! centerlines. The working set for one subdivision is small, so nearest-point
//! search is a linear scan. The resolved milepost is interpolated between the
//! two nearest points of the same track using a local planar projection;
//! interpolation never blends across tracks.

use log::debug;

use crate::geo_utils::{haversine_distance, project_onto_segment, to_local_plane, METERS_PER_MILE};
use crate::types::{ResolvedTrackPosition, SmoothedPosition, TrackReferencePoint};

/// Configuration for milepost resolution.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// When the nearest reference point is within this distance, its milepost
    /// is returned directly instead of interpolating; avoids noisy
    /// interpolation when sitting on a known point.
    /// Default: 15.0 meters
    pub snap_distance_meters: f64,

    /// Maximum distance from the track before the position is reported as
    /// off-track (resolution returns None). Applied to the perpendicular
    /// distance from the interpolated segment, or to the nearest point when
    /// no segment is available.
    /// Default: 0.05 miles (~80 m)
    pub max_offset_miles: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            snap_distance_meters: 15.0,
            max_offset_miles: 0.05,
        }
    }
}

/// Resolve a smoothed position to a milepost on the nearest known track.
///
/// Returns `None` when no track lies within the configured offset; that
/// signals "not currently on any known track" and suppresses boundary and
/// proximity evaluation for the cycle rather than reporting a stale position.
pub fn resolve(
    position: &SmoothedPosition,
    reference_points: &[TrackReferencePoint],
    config: &ResolverConfig,
) -> Option<ResolvedTrackPosition> {
    if reference_points.is_empty() {
        debug!("[Resolver] No reference points loaded, position unresolved");
        return None;
    }

    let max_offset_m = config.max_offset_miles * METERS_PER_MILE;

    // Two nearest points overall, tracked with their distances.
    let mut nearest: Option<(usize, f64)> = None;
    let mut second: Option<(usize, f64)> = None;
    for (i, rp) in reference_points.iter().enumerate() {
        let d = haversine_distance(position.latitude, position.longitude, rp.latitude, rp.longitude);
        match nearest {
            Some((_, nd)) if d >= nd => match second {
                Some((_, sd)) if d >= sd => {}
                _ => second = Some((i, d)),
            },
            _ => {
                second = nearest;
                nearest = Some((i, d));
            }
        }
    }

    let (near_idx, near_dist) = nearest?;
    let near = &reference_points[near_idx];

    // Sitting on a known point: no interpolation needed.
    if near_dist <= config.snap_distance_meters {
        return Some(ResolvedTrackPosition {
            milepost: near.milepost,
            track_type: near.track_type,
            track_number: near.track_number,
            distance_from_track_meters: near_dist,
        });
    }

    let same_track_second = second.filter(|(i, _)| {
        let rp = &reference_points[*i];
        rp.track_type == near.track_type && rp.track_number == near.track_number
    });

    let Some((second_idx, _)) = same_track_second else {
        // Single point, or the two nearest points straddle different tracks:
        // crossing tracks is not interpolated.
        if near_dist > max_offset_m {
            debug!(
                "[Resolver] Nearest point {:.0}m away exceeds {:.0}m offset, off-track",
                near_dist, max_offset_m
            );
            return None;
        }
        return Some(ResolvedTrackPosition {
            milepost: near.milepost,
            track_type: near.track_type,
            track_number: near.track_number,
            distance_from_track_meters: near_dist,
        });
    };

    let far = &reference_points[second_idx];

    // Project onto the segment in a local plane centered on the nearer point.
    let a = (0.0, 0.0);
    let b = to_local_plane(far.latitude, far.longitude, near.latitude, near.longitude);
    let p = to_local_plane(
        position.latitude,
        position.longitude,
        near.latitude,
        near.longitude,
    );
    let (t, dist_from_track) = project_onto_segment(p, a, b);

    if dist_from_track > max_offset_m {
        debug!(
            "[Resolver] Position {:.0}m from track exceeds {:.0}m offset, off-track",
            dist_from_track, max_offset_m
        );
        return None;
    }

    // t is clamped to [0,1], so the milepost never extrapolates past the
    // segment ends.
    let milepost = near.milepost + t * (far.milepost - near.milepost);

    Some(ResolvedTrackPosition {
        milepost,
        track_type: near.track_type,
        track_number: near.track_number,
        distance_from_track_meters: dist_from_track,
    })
}
