use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mockall::mock;
use mockall::predicate::eq;

use mediadex_core::autoscan::{
    AutoscanDirectory, AutoscanRecord, AutoscanRegistry, AutoscanSettings, ScanLevel, ScanMode,
    SharedDirectory, TimerParameter, TimerSubscriber,
};
use mediadex_core::{IndexError, ObjectId, ScanId};

mock! {
    pub Subscriber {}

    impl TimerSubscriber for Subscriber {
        fn timer_notify(&self, parameter: TimerParameter);
    }
}

fn watched(location: &str, persistent: bool) -> SharedDirectory {
    AutoscanDirectory::new(
        location,
        AutoscanSettings {
            mode: ScanMode::Timed,
            level: ScanLevel::Basic,
            recursive: true,
            hidden: false,
            persistent,
            interval: Duration::from_secs(60),
        },
    )
    .shared()
}

#[test]
fn removed_slot_is_reused_by_the_next_directory() {
    let registry = AutoscanRegistry::new();

    let media = watched("/media", true);
    let scan_id = registry.add(media.clone()).unwrap();
    assert_eq!(scan_id, ScanId(0));

    let removed = registry
        .remove_by_location(Path::new("/media"))
        .expect("/media is registered");
    assert_eq!(removed.scan_id(), None);
    assert!(registry.get(ScanId(0)).is_none());

    let music = watched("/music", false);
    assert_eq!(registry.add(music.clone()).unwrap(), ScanId(0));
    assert_eq!(music.scan_id(), Some(ScanId(0)));
    assert_eq!(
        registry.get(ScanId(0)).unwrap().location(),
        Some(Path::new("/music"))
    );
}

#[test]
fn scan_ids_stay_unique_across_adds_and_removes() {
    let registry = AutoscanRegistry::new();
    let mut live: Vec<(ScanId, PathBuf)> = Vec::new();
    let mut removed_ids = Vec::new();

    // Deterministic mix of inserts and removals from various positions.
    let mut seed = 7u32;
    for step in 0..200 {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let remove = !live.is_empty() && seed % 3 == 0;
        if remove {
            let victim = (seed as usize / 3) % live.len();
            let (scan_id, location) = live.swap_remove(victim);
            let dir = registry.remove(scan_id).expect("live entry");
            assert_eq!(dir.location(), Some(location.as_path()));
            removed_ids.push(scan_id);
        } else {
            let location = PathBuf::from(format!("/lib/{step}"));
            let scan_id = registry.add(watched(location.to_str().unwrap(), false)).unwrap();
            removed_ids.retain(|id| *id != scan_id);
            live.push((scan_id, location));
        }

        let ids: HashSet<ScanId> = registry
            .snapshot()
            .iter()
            .map(|dir| dir.scan_id().expect("registered entries have a scan id"))
            .collect();
        assert_eq!(ids.len(), live.len());
        for (scan_id, _) in &live {
            assert!(ids.contains(scan_id));
        }
        for scan_id in &removed_ids {
            assert!(registry.get(*scan_id).is_none());
        }
    }
}

#[test]
fn subtree_removal_leaves_persistent_entries_untouched() {
    let registry = AutoscanRegistry::new();
    registry.add(watched("/a", true)).unwrap();
    registry.add(watched("/a/x", false)).unwrap();
    registry.add(watched("/a/y/z", false)).unwrap();
    registry.add(watched("/b", false)).unwrap();

    let removed = registry.remove_subtree(Path::new("/a"), false);

    assert_eq!(removed.len(), 2);
    let kept = registry.get_by_location(Path::new("/a")).expect("persistent kept");
    assert_eq!(kept.scan_id(), Some(ScanId(0)));
    assert_eq!(
        registry.get_by_location(Path::new("/b")).unwrap().scan_id(),
        Some(ScanId(3))
    );
    assert!(registry.get_by_location(Path::new("/a/x")).is_none());
    assert!(registry.get_by_location(Path::new("/a/y/z")).is_none());

    // The removed copies carry ids of their own registry.
    let ids: Vec<_> = removed.snapshot().iter().map(|dir| dir.scan_id()).collect();
    assert_eq!(ids, vec![Some(ScanId(0)), Some(ScanId(1))]);
}

#[test]
fn duplicate_location_is_rejected_until_removed() {
    let registry = AutoscanRegistry::new();
    registry.add(watched("/media", false)).unwrap();

    let err = registry.add(watched("/media", true)).unwrap_err();
    assert!(matches!(err, IndexError::DuplicateWatch(ref path) if path == Path::new("/media")));

    registry.remove_by_location(Path::new("/media")).unwrap();
    assert!(registry.add(watched("/media", true)).is_ok());
}

#[test]
fn notify_all_hands_out_every_active_parameter() {
    let registry = AutoscanRegistry::new();
    registry.add(watched("/a", false)).unwrap();
    registry.add(watched("/b", false)).unwrap();
    registry.add(watched("/c", false)).unwrap();
    registry.remove(ScanId(1));

    let mut subscriber = MockSubscriber::new();
    for scan_id in [0, 2] {
        subscriber
            .expect_timer_notify()
            .with(eq(TimerParameter {
                mode: ScanMode::Timed,
                scan_id: Some(ScanId(scan_id)),
            }))
            .times(1)
            .return_const(());
    }

    registry.notify_all(&subscriber);
}

#[test]
fn persisted_record_has_no_scan_id() {
    let dir = watched("/media", true);
    dir.set_object_id(Some(ObjectId(12)));
    let registry = AutoscanRegistry::new();
    registry.add(dir.clone()).unwrap();

    let record = dir.record().unwrap();
    let json = serde_json::to_value(&record).unwrap();
    let object = json.as_object().unwrap();

    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec![
            "hidden",
            "interval_secs",
            "last_modified",
            "level",
            "location",
            "mode",
            "object_id",
            "persistent",
            "recursive",
            "storage_id",
        ]
    );
    assert_eq!(object["mode"], "timed");
    assert_eq!(object["level"], "basic");
    assert_eq!(object["object_id"], 12);

    let back: AutoscanRecord = serde_json::from_value(json).unwrap();
    assert_eq!(back, record);
}

#[test]
fn watermark_ignores_older_timestamps() {
    use chrono::{TimeZone, Utc};

    let dir = watched("/media", false);
    let newer = Utc.timestamp_opt(2_000, 0).unwrap();
    let older = Utc.timestamp_opt(1_000, 0).unwrap();

    dir.set_current_lmt(newer);
    dir.set_current_lmt(older);
    assert_eq!(dir.current_lmt(), Some(newer));
}
