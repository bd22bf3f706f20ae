mod common;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use common::{setup, wait_until, TorrentFile};
use parking_lot::Mutex;
use tessera::{
    bandwidth::Direction,
    completion::Completeness,
    ctor::CtorMode,
    error::Error,
    inout,
    peer::{PeerSource, ADDED_F_SEED_FLAG},
    torrent::{Activity, RatioMode, TorrentError},
    tracker::TrackerEvent,
    utils::Ratio,
};

#[test]
fn complete_data_starts_seeding() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("seed.bin", 100_000, 32_768);
    file.write_data(s.download_dir());

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    s.wait_started(&tor, 1);
    assert_eq!(tor.activity(), Activity::Seed);

    let stat = tor.stat();
    assert_eq!(stat.percent_done, 1.0);
    assert_eq!(stat.left_until_done, 0);
    assert_eq!(stat.have_valid, 100_000);
    assert_eq!(stat.have_unchecked, 0);
    assert_eq!(stat.eta, tessera::torrent::Eta::NotAvailable);
    assert!(stat.start_date > 0);
    assert!(tor.is_seed());

    let log = s.log();
    assert_eq!(log, ["peers.add 0", "tracker.start", "peers.start 0"]);
    // nothing new was downloaded, the tracker isn't told we completed
    assert!(!log.contains(&"tracker.completed".to_string()));
}

#[test]
fn missing_data_starts_downloading() {
    let (_dir, s) = setup();
    let file = TorrentFile::multi("album", &[("cd1/a.flac", 40_000), ("b.txt", 100)], 16_384);

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    wait_until("downloading", || tor.activity() == Activity::Download);

    let stat = tor.stat();
    assert_eq!(stat.have_valid, 0);
    assert_eq!(stat.left_until_done, 40_100);
    assert_eq!(stat.percent_done, 0.0);
    // no peers connected, nothing is available
    assert_eq!(stat.desired_available, 0);
    assert_eq!(stat.eta, tessera::torrent::Eta::NotAvailable);
    assert_eq!(tor.count_unchecked(), 0);
}

#[test]
fn duplicates_and_bad_metadata_are_rejected() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("dup.bin", 1000, 16_384);

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    let err = s.session.add_torrent(&s.ctor(&file)).unwrap_err();
    assert!(matches!(err, Error::Duplicate));
    assert_eq!(s.session.torrent_count(), 1);
    assert_eq!(tor.id(), 0);

    let mut ctor = s.ctor(&file);
    ctor.set_metainfo(b"d4:infoi3ee".to_vec());
    let err = s.session.add_torrent(&ctor).unwrap_err();
    assert!(matches!(err, Error::InvalidMetadata(ref f) if f == "info"));

    let mut broken = TorrentFile::single("broken.bin", 1000, 16_384);
    broken.trackers.clear();
    let err = s.session.add_torrent(&s.ctor(&broken)).unwrap_err();
    assert!(matches!(err, Error::InvalidMetadata(ref f) if f == "announce"));

    // 16385 can't be split into blocks
    let odd = TorrentFile::single("odd.bin", 40_000, 16_385);
    let err = s.session.add_torrent(&s.ctor(&odd)).unwrap_err();
    assert!(matches!(err, Error::InvalidBlockSize(16_385)));

    assert_eq!(s.session.torrent_count(), 1);
}

#[test]
fn lookups() {
    let (_dir, s) = setup();
    let a = TorrentFile::single("a.bin", 1000, 16_384);
    let b = TorrentFile::single("b.bin", 2000, 16_384);

    let ta = s.session.add_torrent(&s.ctor(&a)).unwrap();
    let tb = s.session.add_torrent(&s.ctor(&b)).unwrap();
    assert_eq!((ta.id(), tb.id()), (0, 1));

    assert_eq!(s.session.find_by_id(1).unwrap().name(), "b.bin");
    assert_eq!(s.session.find_by_hash(&a.info_hash()).unwrap().id(), 0);
    let upper = tb.hash_string().to_uppercase();
    assert_eq!(s.session.find_by_hash_string(&upper).unwrap().id(), 1);
    assert_eq!(
        s.session.find_by_obfuscated_hash(&b.info_hash().obfuscated()).unwrap().id(),
        1
    );
    assert!(s.session.find_by_id(7).is_none());
    assert!(s.session.find_by_hash_string("nope").is_none());

    let first = s.session.next(None).unwrap();
    let second = s.session.next(Some(&first)).unwrap();
    assert_eq!((first.id(), second.id()), (0, 1));
    assert!(s.session.next(Some(&second)).is_none());

    // ids are never reused
    ta.remove(false);
    s.session.flush().unwrap();
    assert_eq!(s.session.torrent_count(), 1);
    let again = s.session.add_torrent(&s.ctor(&a)).unwrap();
    assert_eq!(again.id(), 2);
}

#[test]
fn forced_pause_wins() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("paused.bin", 1000, 16_384);
    file.write_data(s.download_dir());

    let mut ctor = s.ctor(&file);
    ctor.set_paused(CtorMode::Force, true);
    ctor.set_peer_limit(CtorMode::Force, 7);
    let tor = s.session.add_torrent(&ctor).unwrap();
    s.session.flush().unwrap();

    assert_eq!(tor.activity(), Activity::Stopped);
    assert_eq!(tor.peer_limit(), 7);
    assert!(!s.log().contains(&"tracker.start".to_string()));

    tor.start();
    wait_until("seeding", || tor.activity() == Activity::Seed);
}

#[test]
fn stop_detaches_everything() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("stop.bin", 50_000, 16_384);
    file.write_data(s.download_dir());

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    s.wait_started(&tor, 1);
    assert_eq!(tor.activity(), Activity::Seed);
    assert!(tor.can_manual_announce());

    tor.stop();
    s.session.flush().unwrap();
    assert_eq!(tor.activity(), Activity::Stopped);
    assert!(!tor.can_manual_announce());

    let log = s.log();
    let tail: Vec<_> = log.iter().rev().take(2).rev().cloned().collect();
    assert_eq!(tail, ["peers.stop 0", "tracker.stop"]);

    tor.start();
    s.wait_started(&tor, 2);
    assert_eq!(tor.activity(), Activity::Seed);
}

#[test]
fn remove_tears_down_in_order() {
    let (_dir, s) = setup();
    let file = TorrentFile::multi("album", &[("cd1/a", 20_000), ("cd2/b", 20_000)], 16_384);
    file.write_data(s.download_dir());

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    s.wait_started(&tor, 1);
    assert_eq!(tor.activity(), Activity::Seed);
    let resume = s.config.resume_dir.join(format!("{}.resume", tor.hash_string()));
    assert!(resume.exists());
    assert!(tor.torrent_file().exists());

    s.log.lock().clear();
    tor.remove(true);
    s.session.flush().unwrap();

    assert_eq!(s.log(), ["peers.stop 0", "tracker.stop", "peers.remove 0", "tracker.drop"]);
    assert_eq!(s.session.torrent_count(), 0);
    assert!(!resume.exists());
    assert!(!tor.torrent_file().exists());
    assert!(!s.download_dir().join("album").exists());
}

#[test]
fn delete_local_data_keeps_foreign_files() {
    let (_dir, s) = setup();
    let file = TorrentFile::multi(
        "album",
        &[("cd1/a", 20_000), ("cd2/b", 20_000), ("cd2/deep/c", 100)],
        16_384,
    );
    file.write_data(s.download_dir());
    let album = s.download_dir().join("album");
    std::fs::write(album.join("cd1/notes.txt"), b"mine").unwrap();
    std::fs::write(album.join("cd2/.hidden"), b"x").unwrap();

    let mut ctor = s.ctor(&file);
    ctor.set_paused(CtorMode::Force, true);
    let tor = s.session.add_torrent(&ctor).unwrap();
    tor.delete_local_data().unwrap();

    assert!(album.join("cd1/notes.txt").exists());
    assert!(!album.join("cd1/a").exists());
    assert!(!album.join("cd2").exists());

    let single = TorrentFile::single("one.iso", 1000, 16_384);
    single.write_data(s.download_dir());
    let mut ctor = s.ctor(&single);
    ctor.set_paused(CtorMode::Force, true);
    let tor = s.session.add_torrent(&ctor).unwrap();
    tor.delete_local_data().unwrap();
    assert!(!s.download_dir().join("one.iso").exists());
}

#[test]
fn download_completes() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("dl.bin", 40_000, 16_384);
    let data = file.data();

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    s.wait_started(&tor, 1);
    assert_eq!(tor.activity(), Activity::Download);

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        tor.set_completeness_callback(move |t, c| seen.lock().push((t.id(), c)));
    }

    for piece in 0..tor.geometry().piece_count {
        let size = tor.geometry().piece_size(piece) as usize;
        let begin = piece * 16_384;
        inout::write(&tor, piece, 0, &data[begin..begin + size]).unwrap();
        tor.set_has_piece(piece, true);
        tor.on_piece_data(Direction::Down, size as u64);
    }
    tor.recheck_completeness();

    assert_eq!(*seen.lock(), [(0, Completeness::Seed)]);
    assert!(s.log().contains(&"tracker.completed".to_string()));
    let stat = tor.stat();
    assert!(stat.done_date > 0);
    assert_eq!(stat.downloaded_ever, 40_000);
    assert_eq!(stat.activity, Activity::Seed);
    assert_eq!(std::fs::read(s.download_dir().join("dl.bin")).unwrap(), data);

    let mut buf = vec![0; 100];
    inout::read(&tor, 1, 10, &mut buf).unwrap();
    assert_eq!(buf, data[16_394..16_494]);
    // the last piece is 7232 bytes
    assert!(inout::read(&tor, 2, 7_200, &mut buf).is_err());
}

#[test]
fn ratio_limit_stops_seeding() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("ratio.bin", 10_000, 16_384);
    file.write_data(s.download_dir());

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    s.wait_started(&tor, 1);
    assert_eq!(tor.activity(), Activity::Seed);

    let hit = Arc::new(AtomicBool::new(false));
    {
        let hit = hit.clone();
        tor.set_ratio_limit_hit_callback(move |_| hit.store(true, Ordering::SeqCst));
    }

    tor.set_ratio_limit(1.5);
    // still global, and the session has no limit
    assert!(tor.is_running());
    assert_eq!(tor.seed_ratio(), None);

    tor.on_piece_data(Direction::Up, 10_000);
    tor.set_ratio_mode(RatioMode::Single);
    assert!(tor.is_running(), "ratio 1.0 is below 1.5");

    tor.on_piece_data(Direction::Up, 5_000);
    tor.check_seed_ratio();
    s.session.flush().unwrap();

    assert!(hit.load(Ordering::SeqCst));
    assert!(!tor.is_running());
    assert_eq!(tor.ratio_mode(), RatioMode::Unlimited);
    assert_eq!(tor.activity(), Activity::Stopped);

    let stat = tor.stat();
    assert_eq!(stat.ratio, Ratio::Value(1.5));
    assert_eq!(stat.percent_ratio, 1.0);
}

#[test]
fn session_ratio_applies_to_global_torrents() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("global.bin", 10_000, 16_384);
    file.write_data(s.download_dir());

    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    s.wait_started(&tor, 1);
    assert_eq!(tor.activity(), Activity::Seed);
    tor.on_piece_data(Direction::Up, 5_000);

    s.session.set_ratio_limit(1.0);
    assert!(tor.is_running());
    let stat = tor.stat();
    assert_eq!(stat.percent_ratio, 1.0, "no limit while the session isn't limited");

    s.session.set_ratio_limited(true);
    assert!(tor.is_running());
    assert_eq!(tor.stat().percent_ratio, 0.5);

    s.session.set_ratio_limit(0.5);
    s.session.flush().unwrap();
    assert!(!tor.is_running());
    assert_eq!(tor.ratio_mode(), RatioMode::Unlimited);
}

#[test]
fn tracker_events() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("tr.bin", 1000, 16_384);
    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    let sub = s.trackers.subscriptions.lock()[0].clone();

    sub.publish(TrackerEvent::Peers {
        compact: vec![127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 1, 0, 80],
        all_are_seeds: true,
    });
    sub.publish(TrackerEvent::Warning("slow down".into()));
    s.session.flush().unwrap();

    let pex = s.peers.pex.lock().clone();
    assert_eq!(pex.len(), 2);
    assert!(pex.iter().all(|(from, p)| *from == PeerSource::Tracker
        && p.flags & ADDED_F_SEED_FLAG != 0));
    assert_eq!(tor.error(), (TorrentError::TrackerWarning, "slow down".to_string()));
    assert_eq!(tor.stat().error.code(), -1);

    sub.publish(TrackerEvent::Error("gone".into()));
    s.session.flush().unwrap();
    assert_eq!(tor.error().0, TorrentError::TrackerError);
    assert!(tor.is_running(), "tracker errors don't stop the torrent");

    sub.publish(TrackerEvent::ErrorClear);
    s.session.flush().unwrap();
    assert_eq!(tor.error(), (TorrentError::None, String::new()));

    // events for a freed torrent are dropped
    tor.free();
    s.session.flush().unwrap();
    sub.publish(TrackerEvent::Warning("late".into()));
    s.session.flush().unwrap();
    assert_eq!(tor.error().0, TorrentError::None);
}

#[test]
fn manual_announce_needs_a_running_torrent() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("ann.bin", 1000, 16_384);
    let mut ctor = s.ctor(&file);
    ctor.set_paused(CtorMode::Force, true);
    let tor = s.session.add_torrent(&ctor).unwrap();

    tor.manual_announce();
    s.session.flush().unwrap();
    assert!(!s.log().contains(&"tracker.manual_announce".to_string()));

    tor.start();
    s.wait_started(&tor, 1);
    assert_eq!(tor.activity(), Activity::Download);
    tor.manual_announce();
    s.session.flush().unwrap();
    assert!(s.log().contains(&"tracker.manual_announce".to_string()));
}

#[test]
fn speed_limits() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("speed.bin", 1000, 16_384);
    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();

    // new torrents take the session's speed
    assert_eq!(tor.speed_limit(Direction::Up), 100);
    assert!(tor.is_piece_transfer_allowed(Direction::Up));

    tor.set_speed_limit(Direction::Up, 0);
    assert!(tor.is_piece_transfer_allowed(Direction::Up));
    tor.use_speed_limit(Direction::Up, true);
    assert!(!tor.is_piece_transfer_allowed(Direction::Up));
    assert!(tor.is_piece_transfer_allowed(Direction::Down));

    s.session.set_speed_limit(Direction::Down, 0);
    assert!(tor.is_piece_transfer_allowed(Direction::Down));
    s.session.set_speed_limit_enabled(Direction::Down, true);
    assert!(!tor.is_piece_transfer_allowed(Direction::Down));
    tor.use_session_limits(Direction::Down, false);
    assert!(tor.is_piece_transfer_allowed(Direction::Down));
}

#[test]
fn request_validation() {
    let (_dir, s) = setup();
    // 3 pieces of 32 KiB, the last one is 1000 bytes
    let file = TorrentFile::single("req.bin", 2 * 32_768 + 1000, 32_768);
    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();

    assert!(tor.req_is_valid(0, 0, 16_384));
    assert!(tor.req_is_valid(1, 16_384, 16_384));
    assert!(tor.req_is_valid(2, 0, 1000));
    assert!(!tor.req_is_valid(3, 0, 1), "piece out of range");
    assert!(!tor.req_is_valid(0, 0, 0), "empty request");
    assert!(!tor.req_is_valid(2, 500, 501), "past the last piece");
    assert!(!tor.req_is_valid(0, 0, 32_768), "larger than a block");
    assert_eq!(tor.piece_offset(1, 10, 5), 32_768 + 15);
}

#[test]
fn set_announce_list_rewrites_the_metainfo() {
    let (_dir, s) = setup();
    let file = TorrentFile::single("ann.bin", 1000, 16_384);
    let tor = s.session.add_torrent(&s.ctor(&file)).unwrap();
    let before = std::fs::read(tor.torrent_file()).unwrap();

    let list = vec![
        tessera::metainfo::TrackerInfo::new(0, "http://a.org/announce").unwrap(),
        tessera::metainfo::TrackerInfo::new(0, "udp://b.org:80").unwrap(),
        tessera::metainfo::TrackerInfo::new(1, "https://c.org/announce").unwrap(),
    ];
    tor.set_announce_list(&list).unwrap();

    let trackers = tor.trackers();
    assert_eq!(trackers.len(), 3);
    assert_eq!(trackers[2].tier, 1);
    let saved = tessera::metainfo::Info::parse(&std::fs::read(tor.torrent_file()).unwrap(), None)
        .unwrap();
    assert_eq!(saved.trackers, list);
    assert_eq!(saved.info_hash, *tor.info_hash());
    assert_ne!(std::fs::read(tor.torrent_file()).unwrap(), before);

    let bad = vec![tessera::metainfo::TrackerInfo {
        tier: 0,
        announce: "ftp://nope".into(),
        scrape: None,
    }];
    assert!(matches!(tor.set_announce_list(&bad), Err(Error::TrackerListInvalid)));
    assert!(matches!(tor.set_announce_list(&[]), Err(Error::TrackerListInvalid)));
    assert_eq!(tor.trackers().len(), 3);

    assert_eq!(tor.promote_tracker(1), 0);
    assert_eq!(tor.trackers()[0].announce, list[1].announce);
}

#[test]
fn close_frees_every_torrent() {
    let (_dir, s) = setup();
    let a = TorrentFile::single("a.bin", 1000, 16_384);
    let b = TorrentFile::single("b.bin", 1000, 16_384);
    s.session.add_torrent(&s.ctor(&a)).unwrap();
    s.session.add_torrent(&s.ctor(&b)).unwrap();

    s.session.close();
    assert_eq!(s.session.torrent_count(), 0);
    let log = s.log();
    assert!(log.contains(&"peers.remove 0".to_string()));
    assert!(log.contains(&"peers.remove 1".to_string()));
    assert_eq!(log.iter().filter(|l| *l == "tracker.drop").count(), 2);

    // closing twice is fine
    s.session.close();
}
