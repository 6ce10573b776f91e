//! Integration tests for the content-addressed repository

mod common;

use std::fs;
use std::os::unix::fs::MetadataExt;

use ::common::blob::{
    Blob, BRIDGE, EDITORS, MARK, MESSAGES, MODERATORS, REMOVALS, SUBSCRIBERS,
};
use ::common::crypto::SecretKey;
use ::common::repos::{read_header, Repos, ReposError, Sum};
use chrono::{DateTime, Duration, Utc};

use crate::common::{put, put_at, repos_env};

fn keys(n: usize) -> Vec<SecretKey> {
    (0..n).map(|_| SecretKey::generate()).collect()
}

#[test]
fn test_identical_bytes_dedup() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let blob = Blob::new(owner, owner, "notes").unwrap();

    let first = env.repos.store(&blob, &mut &b"same"[..]).unwrap();
    let second = env.repos.store(&blob, &mut &b"same"[..]).unwrap();
    assert!(first.is_new());
    assert!(!second.is_new());
    assert_eq!(first.sum, second.sum);

    let mut count = 0;
    env.repos
        .filter(DateTime::<Utc>::UNIX_EPOCH, |_, _, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(fs::read_dir(env.dir.path().join("tmp")).unwrap().count(), 0);
}

#[test]
fn test_sum_covers_header_and_content() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let blob = Blob::new(owner, owner, "notes").unwrap();
    let stored = env.repos.store(&blob, &mut &b"body"[..]).unwrap();

    let mut encoded = Vec::new();
    blob.write_to(&mut encoded).unwrap();
    encoded.extend_from_slice(b"body");
    assert_eq!(stored.sum, Sum::of(&encoded));
    assert_eq!(fs::read(env.repos.object_path(&stored.sum)).unwrap(), encoded);
}

#[test]
fn test_slot_keeps_newest_in_any_order() {
    let t = Utc::now();
    for newer_first in [true, false] {
        let env = repos_env();
        let owner = SecretKey::generate().public();
        let older = (b"older".as_slice(), t - Duration::seconds(5));
        let newer = (b"newer".as_slice(), t);
        let order = if newer_first {
            [newer, older]
        } else {
            [older, newer]
        };
        for (content, time) in order {
            put_at(&env.repos, &owner, "profile", content, time);
        }

        let slot = env.repos.user_dir(&owner).join("profile");
        let (blob, mut file) = env.repos.cat(&slot).unwrap();
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut content).unwrap();
        assert_eq!(blob.time, t);
        assert_eq!(content, b"newer");
    }
}

#[test]
fn test_gc_only_reclaims_unlinked_objects() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let t = Utc::now();
    let (_, old) = put_at(&env.repos, &owner, "profile", b"v1", t - Duration::seconds(5));
    let (_, live) = put_at(&env.repos, &owner, "profile", b"v2", t);

    let old_path = env.repos.object_path(&old.sum);
    let live_path = env.repos.object_path(&live.sum);
    assert_eq!(fs::metadata(&old_path).unwrap().nlink(), 1);
    assert_eq!(fs::metadata(&live_path).unwrap().nlink(), 2);

    let report = env.repos.gc(DateTime::<Utc>::UNIX_EPOCH).unwrap();
    assert_eq!(report.removed, 1);
    assert!(!old_path.exists());
    assert!(live_path.exists());
}

#[test]
fn test_filter_since_epoch() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let t = Utc::now();
    let mut want = Vec::new();
    for (i, offset) in [-10i64, 5, 20].into_iter().enumerate() {
        let (_, ingested) = put_at(
            &env.repos,
            &owner,
            &format!("slot{}", i),
            b"x",
            t + Duration::seconds(offset),
        );
        if offset > 0 {
            want.push(ingested.sum);
        }
    }

    let mut got = Vec::new();
    env.repos
        .filter(t, |sum, _, _| {
            got.push(*sum);
            Ok(())
        })
        .unwrap();
    got.sort();
    want.sort();
    assert_eq!(got, want);
}

#[test]
fn test_message_fans_out_to_owner_and_subscribers() {
    let env = repos_env();
    let [owner, sub_a, sub_b] = <[SecretKey; 3]>::try_from(keys(3)).ok().unwrap();
    let subscribers = format!(
        "{} {}",
        sub_a.public().to_hex(),
        sub_b.public().to_hex()
    );
    put(
        &env.repos,
        &owner.public(),
        &owner.public(),
        SUBSCRIBERS,
        subscribers.as_bytes(),
    );
    assert_eq!(env.repos.user(&owner.public()).subscribers.len(), 2);

    // sub_a posts to owner with owner's blessing as an editor
    put(
        &env.repos,
        &owner.public(),
        &owner.public(),
        EDITORS,
        sub_a.public().to_hex().as_bytes(),
    );
    let (_, ingested) = put(&env.repos, &owner.public(), &sub_a.public(), MESSAGES, b"hi all");

    let mut to: Vec<_> = ingested.deliveries.iter().map(|d| d.to).collect();
    to.sort();
    let mut want = vec![owner.public(), sub_b.public()];
    want.sort();
    assert_eq!(to, want);
    for delivery in &ingested.deliveries {
        assert!(delivery.path.starts_with(env.repos.user_dir(&delivery.to)));
        assert_eq!(read_header(&delivery.path).unwrap().author, sub_a.public());
    }
    let sent = env.repos.ls(&env.repos.user_dir(&sub_a.public()).join(MESSAGES)).unwrap();
    assert_eq!(sent.len(), 1);
}

#[test]
fn test_moderated_messages_go_to_moderators() {
    let env = repos_env();
    let [owner, moderator, subscriber] = <[SecretKey; 3]>::try_from(keys(3)).ok().unwrap();
    let (o, m, s) = (owner.public(), moderator.public(), subscriber.public());
    put(&env.repos, &o, &o, MODERATORS, m.to_hex().as_bytes());
    put(&env.repos, &o, &o, SUBSCRIBERS, s.to_hex().as_bytes());

    let (posted, held) = put(&env.repos, &o, &o, "", b"needs review");
    let to: Vec<_> = held.deliveries.iter().map(|d| d.to).collect();
    assert_eq!(to, vec![m]);

    // the moderator releases it through an approvals collection
    let approval = Blob::new(m, m, "asn/approvals/").unwrap();
    let released = env
        .repos
        .ingest(&approval, &mut held.sum.to_hex().as_bytes(), &m)
        .unwrap();
    let to: Vec<_> = released.deliveries.iter().map(|d| d.to).collect();
    assert_eq!(to, vec![s]);
    assert_eq!(released.deliveries[0].sum, held.sum);
    assert_eq!(posted.author, o);
}

#[test]
fn test_bridge_drops_canonical_object() {
    let env = repos_env();
    let [owner, subscriber] = <[SecretKey; 2]>::try_from(keys(2)).ok().unwrap();
    let (o, s) = (owner.public(), subscriber.public());
    put(&env.repos, &o, &o, SUBSCRIBERS, s.to_hex().as_bytes());

    let (_, bridged) = put(&env.repos, &o, &o, BRIDGE, b"relay me");
    assert_eq!(bridged.deliveries.len(), 1);
    assert_eq!(bridged.deliveries[0].to, s);
    assert!(!env.repos.object_path(&bridged.sum).exists());

    // the recipient's entry is the only reference left
    let entry = &bridged.deliveries[0].path;
    assert_eq!(fs::metadata(entry).unwrap().nlink(), 1);
    env.repos.rm(&s, entry).unwrap();
    assert!(!entry.exists());
}

#[test]
fn test_mark_replaces_and_is_not_distributed() {
    let env = repos_env();
    let [owner, subscriber] = <[SecretKey; 2]>::try_from(keys(2)).ok().unwrap();
    let (o, s) = (owner.public(), subscriber.public());
    put(&env.repos, &o, &o, SUBSCRIBERS, s.to_hex().as_bytes());

    let (_, first) = put(&env.repos, &o, &o, MARK, b"first.example:2323");
    let (_, second) = put(&env.repos, &o, &o, MARK, b"second.example:2323");
    assert!(first.deliveries.is_empty());
    assert!(second.deliveries.is_empty());
    assert_eq!(
        env.repos.user(&o).mark.as_deref(),
        Some("second.example:2323")
    );
    let mark = env.repos.user_dir(&o).join(MARK);
    assert_eq!(fs::metadata(&mark).unwrap().ino(), fs::metadata(env.repos.object_path(&second.sum)).unwrap().ino());
}

#[test]
fn test_removals_unlink_then_gc_reclaims() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let (_, doomed) = put(&env.repos, &owner, &owner, "photos/", b"blurry");
    let photos = env.repos.user_dir(&owner).join("photos");
    assert_eq!(env.repos.ls(&photos).unwrap().len(), 1);

    put(
        &env.repos,
        &owner,
        &owner,
        REMOVALS,
        doomed.sum.to_hex().as_bytes(),
    );
    let report = env.repos.gc(DateTime::<Utc>::UNIX_EPOCH).unwrap();
    assert_eq!(report.unlinked, 1);
    assert!(report.removed >= 1);
    assert!(env.repos.ls(&photos).unwrap().is_empty());
    assert!(!env.repos.object_path(&doomed.sum).exists());
}

#[test]
fn test_non_editor_write_is_denied() {
    let env = repos_env();
    let [owner, stranger] = <[SecretKey; 2]>::try_from(keys(2)).ok().unwrap();
    let blob = Blob::new(owner.public(), stranger.public(), "profile").unwrap();
    let err = env
        .repos
        .ingest(&blob, &mut &b"mine now"[..], &stranger.public())
        .unwrap_err();
    assert!(matches!(err, ReposError::Permission(_)));
    assert!(!env.repos.user_dir(&owner.public()).join("profile").exists());
}

#[test]
fn test_reopen_reloads_control_lists() {
    let env = repos_env();
    let [owner, editor] = <[SecretKey; 2]>::try_from(keys(2)).ok().unwrap();
    put(
        &env.repos,
        &owner.public(),
        &owner.public(),
        EDITORS,
        editor.public().to_hex().as_bytes(),
    );

    let reopened = Repos::open(
        env.dir.path(),
        env.service.public(),
        Some(env.admin.public()),
    )
    .unwrap();
    assert!(reopened.user(&owner.public()).is_editor(&editor.public()));
    assert!(reopened.users().contains(&owner.public()));
}

#[test]
fn test_resolve_paths() {
    let env = repos_env();
    let [me, other] = <[SecretKey; 2]>::try_from(keys(2)).ok().unwrap();
    let sum = Sum::of(b"anything");

    assert_eq!(
        env.repos.resolve(&me.public(), "notes").unwrap(),
        env.repos.user_dir(&me.public()).join("notes")
    );
    assert_eq!(
        env.repos
            .resolve(&me.public(), &format!("~{}/asn/mark", other.public().to_hex()))
            .unwrap(),
        env.repos.user_dir(&other.public()).join("asn/mark")
    );
    assert_eq!(
        env.repos.resolve(&me.public(), &sum.to_hex()).unwrap(),
        env.repos.object_path(&sum)
    );
    assert!(matches!(
        env.repos.resolve(&me.public(), "../../etc"),
        Err(ReposError::BadPath(_))
    ));
}

#[test]
fn test_collection_entry_is_epoch_and_sum() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let (blob, stored) = put(&env.repos, &owner, &owner, "photos/", b"sunset");
    let photos = env.repos.user_dir(&owner).join("photos");
    assert_eq!(
        env.repos.ls(&photos).unwrap(),
        vec![format!("{}_{}", blob.epoch(), stored.sum.to_hex())]
    );
}

#[test]
fn test_duplicate_ingest_adds_no_link() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let blob = Blob::new(owner, owner, "notes/").unwrap();
    let first = env.repos.ingest(&blob, &mut &b"same"[..], &owner).unwrap();
    let object = env.repos.object_path(&first.sum);
    assert_eq!(fs::metadata(&object).unwrap().nlink(), 2);

    let second = env.repos.ingest(&blob, &mut &b"same"[..], &owner).unwrap();
    assert!(!second.new);
    assert_eq!(second.sum, first.sum);
    assert!(second.deliveries.is_empty());
    assert_eq!(fs::metadata(&object).unwrap().nlink(), 2);
    let notes = env.repos.user_dir(&owner).join("notes");
    assert_eq!(env.repos.ls(&notes).unwrap().len(), 1);
}

#[test]
fn test_gc_reclaims_stale_slot_write() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let t = Utc::now();
    let (_, kept) = put_at(&env.repos, &owner, "profile", b"new", t);
    let (_, stale) = put_at(&env.repos, &owner, "profile", b"old", t - Duration::seconds(5));
    assert!(stale.new);
    assert!(stale.deliveries.is_empty());

    let stale_path = env.repos.object_path(&stale.sum);
    assert_eq!(fs::metadata(&stale_path).unwrap().nlink(), 1);
    let report = env.repos.gc(DateTime::<Utc>::UNIX_EPOCH).unwrap();
    assert_eq!(report.removed, 1);
    assert!(!stale_path.exists());
    assert!(env.repos.object_path(&kept.sum).exists());
}

#[test]
fn test_moderated_post_keeps_author_copy() {
    let env = repos_env();
    let [owner, moderator, editor] = <[SecretKey; 3]>::try_from(keys(3)).ok().unwrap();
    let (o, m, e) = (owner.public(), moderator.public(), editor.public());
    put(&env.repos, &o, &o, MODERATORS, m.to_hex().as_bytes());
    put(&env.repos, &o, &o, EDITORS, e.to_hex().as_bytes());

    let (_, held) = put(&env.repos, &o, &e, MESSAGES, b"hold this");
    let to: Vec<_> = held.deliveries.iter().map(|d| d.to).collect();
    assert_eq!(to, vec![m]);

    let sent = env.repos.user_dir(&e).join(MESSAGES);
    let entries = env.repos.ls(&sent).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        fs::metadata(sent.join(&entries[0])).unwrap().ino(),
        fs::metadata(env.repos.object_path(&held.sum)).unwrap().ino()
    );
    assert!(!env.repos.user_dir(&o).join(MESSAGES).exists());
}

#[test]
fn test_gc_reads_nested_logs_and_skips_bad_ones() {
    let env = repos_env();
    let owner = SecretKey::generate().public();
    let (_, doomed) = put(&env.repos, &owner, &owner, "photos/", b"blurry");
    put(
        &env.repos,
        &owner,
        &owner,
        "asn/removals/old/",
        doomed.sum.to_hex().as_bytes(),
    );
    let logs = env.repos.user_dir(&owner).join(REMOVALS);
    assert!(logs.join("old").is_dir());
    fs::write(logs.join("junk"), b"not an object").unwrap();

    let report = env.repos.gc(DateTime::<Utc>::UNIX_EPOCH).unwrap();
    assert_eq!(report.unlinked, 1);
    assert!(!env.repos.object_path(&doomed.sum).exists());
    assert!(env.repos.ls(&env.repos.user_dir(&owner).join("photos")).unwrap().is_empty());
}
