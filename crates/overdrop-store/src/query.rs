//! Pure match/sort/aggregate semantics shared by every backend, so the
//! in-memory and redb stores cannot diverge on what a query means.

use chrono::{DateTime, Utc};
use overdrop_domain::{
    depends_overlap, DependsTuple, Deployment, DeploymentStatus, DeviceDeployment,
    DeviceDeploymentStatus, Image, Release, Stats,
};

use crate::store::{
    DeploymentQuery, ImageFilter, ImageSort, ReleaseFilter, SortOrder,
};

// ── Deployments ──────────────────────────────────────────────────────────────

pub fn matches_deployment_query(d: &Deployment, q: &DeploymentQuery) -> bool {
    if let Some(search) = &q.search {
        let needle = search.to_lowercase();
        let hit = d.name.to_lowercase().contains(&needle)
            || d.artifact_name.to_lowercase().contains(&needle);
        if !hit {
            return false;
        }
    }
    if let Some(status) = q.status {
        if d.status != status {
            return false;
        }
    }
    if let Some(ty) = q.deployment_type {
        if d.deployment_type != ty {
            return false;
        }
    }
    if let Some(after) = q.created_after {
        if d.created < after {
            return false;
        }
    }
    if let Some(before) = q.created_before {
        if d.created > before {
            return false;
        }
    }
    true
}

pub fn sort_deployments(deployments: &mut [Deployment], order: SortOrder) {
    deployments.sort_by(|a, b| match order {
        SortOrder::Ascending => a.created.cmp(&b.created),
        SortOrder::Descending => b.created.cmp(&a.created),
    });
}

/// Stamp `finished` and flip `status` to whatever the counters now imply.
/// Runs inside the same store update as the counter change.
pub fn derive_lifecycle(d: &mut Deployment, now: DateTime<Utc>) {
    let status = d.stats.deployment_status(d.finished.is_some(), d.max_devices);
    if status == DeploymentStatus::Finished && d.finished.is_none() {
        d.finished = Some(now);
    }
    d.status = status;
}

pub fn apply_stat_increment(
    d: &mut Deployment,
    from: Option<DeviceDeploymentStatus>,
    to: DeviceDeploymentStatus,
    now: DateTime<Utc>,
) {
    d.stats.apply(from, to);
    derive_lifecycle(d, now);
}

pub fn apply_stats(d: &mut Deployment, stats: Stats, now: DateTime<Utc>) {
    d.stats = stats;
    derive_lifecycle(d, now);
}

// ── Images ───────────────────────────────────────────────────────────────────

/// The uniqueness check behind the `(artifact name, device type, depends
/// tuple)` index. Returns the offending `(device type, tuple)` when the two
/// images cannot coexist. Caller guarantees equal artifact names.
pub fn image_conflict(new: &Image, existing: &Image) -> Option<(String, DependsTuple)> {
    for device_type in &new.device_types {
        if !existing.supports_device_type(device_type) {
            continue;
        }
        for tuple in &new.depends_idx {
            if existing
                .depends_idx
                .iter()
                .any(|other| depends_overlap(tuple, other))
            {
                return Some((device_type.clone(), tuple.clone()));
            }
        }
    }
    None
}

pub fn matches_image_filter(image: &Image, f: &ImageFilter) -> bool {
    if let Some(name) = &f.name {
        if &image.name != name {
            return false;
        }
    }
    if let Some(description) = &f.description {
        if !image
            .description
            .to_lowercase()
            .contains(&description.to_lowercase())
        {
            return false;
        }
    }
    if let Some(device_type) = &f.device_type {
        if !image.supports_device_type(device_type) {
            return false;
        }
    }
    true
}

pub fn sort_images(images: &mut [Image], sort: ImageSort, order: SortOrder) {
    images.sort_by(|a, b| {
        let cmp = match sort {
            ImageSort::Name => a.name.cmp(&b.name),
            ImageSort::Modified => a.modified.cmp(&b.modified),
        };
        match order {
            SortOrder::Ascending => cmp,
            SortOrder::Descending => cmp.reverse(),
        }
    });
}

/// The deterministic tie-break used everywhere more than one image is
/// eligible: smallest size wins, id breaks exact size ties.
pub fn smallest(images: Vec<Image>) -> Option<Image> {
    images.into_iter().min_by_key(|i| (i.size, i.id))
}

// ── Releases ─────────────────────────────────────────────────────────────────

pub fn matches_release_filter(release: &Release, f: &ReleaseFilter) -> bool {
    if let Some(name) = &f.name {
        if &release.name != name {
            return false;
        }
    }
    if let Some(description) = &f.description {
        let needle = description.to_lowercase();
        if !release
            .artifacts
            .iter()
            .any(|i| i.description.to_lowercase().contains(&needle))
        {
            return false;
        }
    }
    if let Some(device_type) = &f.device_type {
        if !release
            .artifacts
            .iter()
            .any(|i| i.supports_device_type(device_type))
        {
            return false;
        }
    }
    if let Some(tag) = &f.tag {
        if !release.tags.contains(tag) {
            return false;
        }
    }
    if let Some(update_type) = &f.update_type {
        if !release.update_types().iter().any(|t| t == update_type) {
            return false;
        }
    }
    true
}

// ── Device-deployments ───────────────────────────────────────────────────────

pub fn aggregate_counts<'a>(rows: impl Iterator<Item = &'a DeviceDeployment>) -> Stats {
    let mut stats = Stats::new();
    for row in rows {
        stats.inc(row.status);
    }
    stats
}

// ── Paging ───────────────────────────────────────────────────────────────────

/// `limit == 0` means unlimited.
pub fn page<T>(items: Vec<T>, skip: usize, limit: usize) -> Vec<T> {
    let iter = items.into_iter().skip(skip);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}
