//! Three-way diff: change detection and action selection
//!
//! For every relative path present remotely, locally, or in the snapshot,
//! the presence triple plus per-side change flags select an action from the
//! truth table. Direction filters the result: `cloud→local` emits only
//! downloads and local deletes, `local→cloud` the mirror, and a conflict
//! falls back through the policy before the filter applies.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;

use drivemesh_core::domain::{
    ConflictPolicy, DetectionMode, SnapshotEntry, SyncDirection,
};

use crate::enumerate::{LocalFile, RemoteFile};

/// Tolerated mtime drift for `size_mtime` detection.
const MTIME_TOLERANCE_SECS: i64 = 2;

/// One executable reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Replace (or create) the local file from the remote one.
    Download { rel: String, token: String },
    /// Replace (or create) the remote file from the local one. When
    /// `replaces` holds the stale remote token it is deleted first.
    Upload { rel: String, replaces: Option<String> },
    DeleteRemote { rel: String, token: String },
    DeleteLocal { rel: String },
}

impl SyncAction {
    pub fn rel(&self) -> &str {
        match self {
            SyncAction::Download { rel, .. }
            | SyncAction::Upload { rel, .. }
            | SyncAction::DeleteRemote { rel, .. }
            | SyncAction::DeleteLocal { rel } => rel,
        }
    }
}

fn allows_download(direction: SyncDirection) -> bool {
    matches!(
        direction,
        SyncDirection::CloudToLocal | SyncDirection::Bidirectional
    )
}

fn allows_upload(direction: SyncDirection) -> bool {
    matches!(
        direction,
        SyncDirection::LocalToCloud | SyncDirection::Bidirectional
    )
}

// Local deletes travel with downloads, remote deletes with uploads.
fn allows_local_delete(direction: SyncDirection) -> bool {
    allows_download(direction)
}

fn allows_remote_delete(direction: SyncDirection) -> bool {
    allows_upload(direction)
}

fn mtime_drifted(a: chrono::DateTime<chrono::Utc>, b: chrono::DateTime<chrono::Utc>) -> bool {
    (a - b).abs() > Duration::seconds(MTIME_TOLERANCE_SECS)
}

/// Whether the remote side changed relative to the snapshot.
fn remote_changed(mode: DetectionMode, remote: &RemoteFile, snap: &SnapshotEntry) -> bool {
    match mode {
        DetectionMode::Metadata => {
            snap.remote_token.as_deref() != Some(remote.token.as_str())
                || remote.mtime != snap.mtime
        }
        DetectionMode::SizeMtime => {
            remote.size != snap.size || mtime_drifted(remote.mtime, snap.mtime)
        }
        DetectionMode::Checksum => match (remote.checksum, snap.checksum) {
            // The size_mtime condition still applies; the checksum only adds
            // sensitivity on top of it.
            (Some(r), Some(s)) => {
                remote.size != snap.size
                    || mtime_drifted(remote.mtime, snap.mtime)
                    || r != s
            }
            // Re-downloading just to hash is avoided: size-only fallback.
            _ => remote.size != snap.size,
        },
    }
}

/// Whether the local side changed relative to the snapshot.
fn local_changed(mode: DetectionMode, local: &LocalFile, snap: &SnapshotEntry) -> bool {
    match mode {
        DetectionMode::Metadata => local.mtime != snap.mtime,
        DetectionMode::SizeMtime => {
            local.size != snap.size || mtime_drifted(local.mtime, snap.mtime)
        }
        DetectionMode::Checksum => {
            let base = local.size != snap.size || mtime_drifted(local.mtime, snap.mtime);
            match (local.checksum, snap.checksum) {
                (Some(l), Some(s)) => base || l != s,
                _ => base,
            }
        }
    }
}

/// Computes the action plan for one task run.
#[allow(clippy::too_many_arguments)]
pub fn plan(
    direction: SyncDirection,
    detection: DetectionMode,
    conflict: ConflictPolicy,
    propagate_delete: bool,
    remote: &BTreeMap<String, RemoteFile>,
    local: &BTreeMap<String, LocalFile>,
    snapshot: &BTreeMap<String, SnapshotEntry>,
) -> Vec<SyncAction> {
    let mut rels: BTreeSet<&str> = BTreeSet::new();
    rels.extend(remote.keys().map(|s| s.as_str()));
    rels.extend(local.keys().map(|s| s.as_str()));
    rels.extend(snapshot.keys().map(|s| s.as_str()));

    let mut actions = Vec::new();
    for rel in rels {
        let r = remote.get(rel);
        let l = local.get(rel);
        let s = snapshot.get(rel);

        let action = match (r, l, s) {
            (None, None, _) => None, // includes (−,−,+): the entry just drops

            // New on exactly one side.
            (Some(r), None, None) => allows_download(direction).then(|| SyncAction::Download {
                rel: rel.to_string(),
                token: r.token.clone(),
            }),
            (None, Some(_), None) => allows_upload(direction).then(|| SyncAction::Upload {
                rel: rel.to_string(),
                replaces: None,
            }),

            // New on both sides: a conflict with no base.
            (Some(r), Some(l), None) => resolve_conflict(direction, conflict, rel, r, Some(l)),

            // Deleted locally, still remote.
            (Some(r), None, Some(_)) => {
                if propagate_delete && allows_remote_delete(direction) {
                    Some(SyncAction::DeleteRemote {
                        rel: rel.to_string(),
                        token: r.token.clone(),
                    })
                } else if allows_download(direction) {
                    Some(SyncAction::Download {
                        rel: rel.to_string(),
                        token: r.token.clone(),
                    })
                } else {
                    None
                }
            }

            // Deleted remotely, still local.
            (None, Some(_), Some(_)) => {
                if propagate_delete && allows_local_delete(direction) {
                    Some(SyncAction::DeleteLocal {
                        rel: rel.to_string(),
                    })
                } else if allows_upload(direction) {
                    Some(SyncAction::Upload {
                        rel: rel.to_string(),
                        replaces: None,
                    })
                } else {
                    None
                }
            }

            // Present everywhere: the change matrix.
            (Some(r), Some(l), Some(s)) => {
                let rc = remote_changed(detection, r, s);
                let lc = local_changed(detection, l, s);
                match (rc, lc) {
                    (false, false) => None,
                    (true, false) => allows_download(direction).then(|| SyncAction::Download {
                        rel: rel.to_string(),
                        token: r.token.clone(),
                    }),
                    (false, true) => allows_upload(direction).then(|| SyncAction::Upload {
                        rel: rel.to_string(),
                        replaces: Some(r.token.clone()),
                    }),
                    (true, true) => resolve_conflict(direction, conflict, rel, r, Some(l)),
                }
            }
        };

        if let Some(action) = action {
            actions.push(action);
        }
    }
    actions
}

/// Applies the conflict policy, then the direction filter.
fn resolve_conflict(
    direction: SyncDirection,
    policy: ConflictPolicy,
    rel: &str,
    remote: &RemoteFile,
    local: Option<&LocalFile>,
) -> Option<SyncAction> {
    let remote_wins = match policy {
        ConflictPolicy::PreferRemote => true,
        ConflictPolicy::PreferLocal => false,
        ConflictPolicy::Newest => match local {
            // A tie goes to remote.
            Some(local) => remote.mtime >= local.mtime,
            None => true,
        },
    };

    if remote_wins {
        allows_download(direction).then(|| SyncAction::Download {
            rel: rel.to_string(),
            token: remote.token.clone(),
        })
    } else {
        allows_upload(direction).then(|| SyncAction::Upload {
            rel: rel.to_string(),
            replaces: Some(remote.token.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t(secs: i64) -> chrono::DateTime<chrono::Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn remote(token: &str, size: u64, mtime_offset: i64) -> RemoteFile {
        RemoteFile {
            token: token.to_string(),
            size,
            mtime: t(mtime_offset),
            checksum: None,
        }
    }

    fn local(size: u64, mtime_offset: i64) -> LocalFile {
        LocalFile {
            path: std::path::PathBuf::from("/x"),
            size,
            mtime: t(mtime_offset),
            checksum: None,
        }
    }

    fn snap(size: u64, mtime_offset: i64, token: Option<&str>) -> SnapshotEntry {
        SnapshotEntry {
            size,
            mtime: t(mtime_offset),
            remote_token: token.map(|s| s.to_string()),
            checksum: None,
        }
    }

    fn plan_one(
        direction: SyncDirection,
        conflict: ConflictPolicy,
        propagate: bool,
        r: Option<RemoteFile>,
        l: Option<LocalFile>,
        s: Option<SnapshotEntry>,
    ) -> Vec<SyncAction> {
        let mut remote = BTreeMap::new();
        let mut localm = BTreeMap::new();
        let mut snapm = BTreeMap::new();
        if let Some(r) = r {
            remote.insert("x.txt".to_string(), r);
        }
        if let Some(l) = l {
            localm.insert("x.txt".to_string(), l);
        }
        if let Some(s) = s {
            snapm.insert("x.txt".to_string(), s);
        }
        plan(
            direction,
            DetectionMode::SizeMtime,
            conflict,
            propagate,
            &remote,
            &localm,
            &snapm,
        )
    }

    #[test]
    fn remote_only_downloads_in_bidirectional() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok", 5, 0)),
            None,
            None,
        );
        assert_eq!(
            actions,
            vec![SyncAction::Download {
                rel: "x.txt".into(),
                token: "tok".into()
            }]
        );
    }

    #[test]
    fn remote_only_is_noop_in_local_to_cloud() {
        let actions = plan_one(
            SyncDirection::LocalToCloud,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok", 5, 0)),
            None,
            None,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn local_only_uploads_in_local_to_cloud() {
        let actions = plan_one(
            SyncDirection::LocalToCloud,
            ConflictPolicy::Newest,
            false,
            None,
            Some(local(5, 0)),
            None,
        );
        assert_eq!(
            actions,
            vec![SyncAction::Upload {
                rel: "x.txt".into(),
                replaces: None
            }]
        );
    }

    #[test]
    fn local_only_is_noop_in_cloud_to_local() {
        let actions = plan_one(
            SyncDirection::CloudToLocal,
            ConflictPolicy::Newest,
            false,
            None,
            Some(local(5, 0)),
            None,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn both_deleted_drops_silently() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            true,
            None,
            None,
            Some(snap(5, 0, Some("tok"))),
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn local_delete_propagates_to_remote() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            true,
            Some(remote("tok", 5, 0)),
            None,
            Some(snap(5, 0, Some("tok"))),
        );
        assert_eq!(
            actions,
            vec![SyncAction::DeleteRemote {
                rel: "x.txt".into(),
                token: "tok".into()
            }]
        );
    }

    #[test]
    fn local_delete_without_propagation_redownloads() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok", 5, 0)),
            None,
            Some(snap(5, 0, Some("tok"))),
        );
        assert_eq!(
            actions,
            vec![SyncAction::Download {
                rel: "x.txt".into(),
                token: "tok".into()
            }]
        );
    }

    #[test]
    fn remote_delete_propagates_locally() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            true,
            None,
            Some(local(5, 0)),
            Some(snap(5, 0, Some("tok"))),
        );
        assert_eq!(actions, vec![SyncAction::DeleteLocal { rel: "x.txt".into() }]);
    }

    #[test]
    fn unchanged_triple_is_noop() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            true,
            Some(remote("tok", 5, 0)),
            Some(local(5, 0)),
            Some(snap(5, 0, Some("tok"))),
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn single_sided_change_propagates_that_side() {
        // Remote grew.
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok2", 9, 60)),
            Some(local(5, 0)),
            Some(snap(5, 0, Some("tok"))),
        );
        assert_eq!(
            actions,
            vec![SyncAction::Download {
                rel: "x.txt".into(),
                token: "tok2".into()
            }]
        );

        // Local grew; the stale remote token is replaced.
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok", 5, 0)),
            Some(local(9, 60)),
            Some(snap(5, 0, Some("tok"))),
        );
        assert_eq!(
            actions,
            vec![SyncAction::Upload {
                rel: "x.txt".into(),
                replaces: Some("tok".into())
            }]
        );
    }

    #[test]
    fn newest_policy_picks_the_larger_mtime() {
        // Snapshot {size 10, mtime T}; remote {12, T+30}; local {11, T+10}.
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok2", 12, 30)),
            Some(local(11, 10)),
            Some(snap(10, 0, Some("tok"))),
        );
        assert_eq!(
            actions,
            vec![SyncAction::Download {
                rel: "x.txt".into(),
                token: "tok2".into()
            }]
        );
    }

    #[test]
    fn newest_tie_prefers_remote() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok2", 12, 30)),
            Some(local(11, 30)),
            Some(snap(10, 0, Some("tok"))),
        );
        assert!(matches!(actions[0], SyncAction::Download { .. }));
    }

    #[test]
    fn prefer_local_overrides_mtimes() {
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::PreferLocal,
            false,
            Some(remote("tok2", 12, 300)),
            Some(local(11, 10)),
            Some(snap(10, 0, Some("tok"))),
        );
        assert_eq!(
            actions,
            vec![SyncAction::Upload {
                rel: "x.txt".into(),
                replaces: Some("tok2".into())
            }]
        );
    }

    #[test]
    fn conflict_winner_still_respects_direction() {
        // Remote wins by policy, but local→cloud cannot download: no-op.
        let actions = plan_one(
            SyncDirection::LocalToCloud,
            ConflictPolicy::PreferRemote,
            false,
            Some(remote("tok2", 12, 30)),
            Some(local(11, 10)),
            Some(snap(10, 0, Some("tok"))),
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn mtime_tolerance_suppresses_jitter() {
        // 2 seconds of drift with equal sizes is not a change.
        let actions = plan_one(
            SyncDirection::Bidirectional,
            ConflictPolicy::Newest,
            false,
            Some(remote("tok", 5, 2)),
            Some(local(5, 1)),
            Some(snap(5, 0, Some("tok"))),
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn metadata_mode_tracks_token_changes() {
        let mut remote_map = BTreeMap::new();
        remote_map.insert("x.txt".to_string(), remote("tok2", 5, 0));
        let mut local_map = BTreeMap::new();
        local_map.insert("x.txt".to_string(), local(5, 0));
        let mut snap_map = BTreeMap::new();
        snap_map.insert("x.txt".to_string(), snap(5, 0, Some("tok1")));

        let actions = plan(
            SyncDirection::Bidirectional,
            DetectionMode::Metadata,
            ConflictPolicy::Newest,
            false,
            &remote_map,
            &local_map,
            &snap_map,
        );
        // Token changed remotely, local mtime identical: download.
        assert_eq!(
            actions,
            vec![SyncAction::Download {
                rel: "x.txt".into(),
                token: "tok2".into()
            }]
        );
    }

    #[test]
    fn checksum_mode_still_honors_mtime_drift() {
        // Same size, same Adler-32 residue, but the remote mtime moved well
        // past the tolerance window: checksum mode must stay at least as
        // sensitive as size_mtime, not weaker.
        let mut remote_map = BTreeMap::new();
        remote_map.insert(
            "x.txt".to_string(),
            RemoteFile {
                token: "tok".into(),
                size: 5,
                mtime: t(60),
                checksum: Some(111),
            },
        );
        let mut local_map = BTreeMap::new();
        local_map.insert(
            "x.txt".to_string(),
            LocalFile {
                path: std::path::PathBuf::from("/x"),
                size: 5,
                mtime: t(0),
                checksum: Some(111),
            },
        );
        let mut snap_map = BTreeMap::new();
        snap_map.insert(
            "x.txt".to_string(),
            SnapshotEntry {
                size: 5,
                mtime: t(0),
                remote_token: Some("tok".into()),
                checksum: Some(111),
            },
        );

        let actions = plan(
            SyncDirection::Bidirectional,
            DetectionMode::Checksum,
            ConflictPolicy::Newest,
            false,
            &remote_map,
            &local_map,
            &snap_map,
        );
        assert_eq!(
            actions,
            vec![SyncAction::Download {
                rel: "x.txt".into(),
                token: "tok".into()
            }]
        );
    }

    #[test]
    fn checksum_mode_catches_same_size_same_mtime_edits() {
        let mut remote_map = BTreeMap::new();
        remote_map.insert(
            "x.txt".to_string(),
            RemoteFile {
                token: "tok".into(),
                size: 5,
                mtime: t(0),
                checksum: Some(111),
            },
        );
        let mut local_map = BTreeMap::new();
        local_map.insert(
            "x.txt".to_string(),
            LocalFile {
                path: std::path::PathBuf::from("/x"),
                size: 5,
                mtime: t(0),
                checksum: Some(222),
            },
        );
        let mut snap_map = BTreeMap::new();
        snap_map.insert(
            "x.txt".to_string(),
            SnapshotEntry {
                size: 5,
                mtime: t(0),
                remote_token: Some("tok".into()),
                checksum: Some(111),
            },
        );

        let actions = plan(
            SyncDirection::Bidirectional,
            DetectionMode::Checksum,
            ConflictPolicy::Newest,
            false,
            &remote_map,
            &local_map,
            &snap_map,
        );
        // Only the local content differs from the snapshot checksum.
        assert_eq!(
            actions,
            vec![SyncAction::Upload {
                rel: "x.txt".into(),
                replaces: Some("tok".into())
            }]
        );
    }
}
