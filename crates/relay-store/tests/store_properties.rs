//! Store-wide properties exercised through the public API.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use relay_shared::RecipientId;
use relay_store::attachments::AttachmentStore;
use relay_store::prelude::*;
use relay_store::{Attachment, Database, Message, StoreOptions};

fn open_store() -> (tempfile::TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in(dir.path(), StoreOptions::default()).unwrap();
    db.register_builtin_views().unwrap();
    (dir, db)
}

fn rid(id: &str) -> RecipientId {
    RecipientId::from(id)
}

fn incoming(thread_id: &str, timestamp: u64) -> Message {
    Message::incoming(thread_id, rid("alice"), 1, timestamp, Some(format!("at {timestamp}")))
}

#[test]
fn interaction_count_tracks_random_inserts_and_deletes() {
    let (_dir, db) = open_store();
    let thread_id = db
        .write(|txn| txn.get_or_create_thread_with_participants(&[rid("me"), rid("alice")]))
        .unwrap()
        .unique_id;

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<String> = Vec::new();

    for _ in 0..40 {
        let expected = db
            .write(|txn| {
                let ops = rng.gen_range(1..5);
                for _ in 0..ops {
                    if live.is_empty() || rng.gen_bool(0.6) {
                        let message = incoming(&thread_id, rng.gen_range(0..50));
                        txn.save_message(&message)?;
                        live.push(message.unique_id);
                    } else {
                        let victim = live.swap_remove(rng.gen_range(0..live.len()));
                        assert!(txn.remove_message(&victim, false)?);
                    }
                }
                // Consistent inside the transaction as well.
                assert_eq!(txn.number_of_interactions(&thread_id)?, live.len());
                Ok(live.len())
            })
            .unwrap();

        db.read(|txn| {
            assert_eq!(txn.number_of_interactions(&thread_id)?, expected);
            let ordered = txn.interactions(&thread_id)?;
            assert!(ordered
                .windows(2)
                .all(|w| (w[0].timestamp, &w[0].unique_id) < (w[1].timestamp, &w[1].unique_id)));
            Ok(())
        })
        .unwrap();
    }
}

#[test]
fn mark_all_read_is_visible_in_same_transaction() {
    let (_dir, db) = open_store();
    db.write(|txn| {
        let thread = txn.get_or_create_thread("t1")?;
        txn.save_message(&incoming(&thread.unique_id, 1))?;
        txn.save_message(&incoming(&thread.unique_id, 2))?;
        assert_eq!(txn.unread_count("t1")?, 2);
        txn.mark_all_read("t1")?;
        assert_eq!(txn.unread_count("t1")?, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn equal_timestamps_sort_by_unique_id() {
    let (_dir, db) = open_store();
    db.write(|txn| {
        txn.get_or_create_thread("t1")?;
        for id in ["c", "a", "b"] {
            txn.save_message(&incoming("t1", 7).with_id(id))?;
        }
        Ok(())
    })
    .unwrap();

    let ids = db.read(|txn| txn.interaction_ids("t1")).unwrap();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

#[test]
fn get_or_create_ignores_participant_order() {
    let (_dir, db) = open_store();
    let (first, second, reversed) = db
        .write(|txn| {
            let first = txn.get_or_create_thread_with_participants(&[rid("A"), rid("B")])?;
            let second = txn.get_or_create_thread_with_participants(&[rid("A"), rid("B")])?;
            let reversed = txn.get_or_create_thread_with_participants(&[rid("B"), rid("A")])?;
            Ok((first.unique_id, second.unique_id, reversed.unique_id))
        })
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first, reversed);
}

#[test]
fn attachment_survives_only_when_kept() {
    let (dir, db) = open_store();
    let files = AttachmentStore::new(dir.path().join("attachments")).unwrap();

    let (kept, dropped) = db
        .write(|txn| {
            txn.get_or_create_thread("t1")?;
            let kept = txn.save_attachment_data(&files, Attachment::new("text/plain", 0), b"keep me")?;
            let dropped = txn.save_attachment_data(&files, Attachment::new("text/plain", 0), b"drop me")?;
            let first = incoming("t1", 1).with_attachments(vec![kept.unique_id.clone()]);
            let second = incoming("t1", 2).with_attachments(vec![dropped.unique_id.clone()]);
            txn.save_message(&first)?;
            txn.save_message(&second)?;
            txn.remove_message(&first.unique_id, true)?;
            txn.remove_message(&second.unique_id, false)?;
            Ok((kept, dropped))
        })
        .unwrap();

    db.read(|txn| {
        let kept_record = txn.attachment(&kept.unique_id)?.unwrap();
        assert_eq!(files.read_verified(&kept_record)?, b"keep me");
        assert!(txn.attachment(&dropped.unique_id)?.is_none());
        Ok(())
    })
    .unwrap();
    assert!(!dropped.local_path.unwrap().exists());
}

#[test]
fn archive_then_unarchive_restores_inbox() {
    let (_dir, db) = open_store();
    db.write(|txn| {
        txn.get_or_create_thread("t1")?;
        txn.save_message(&incoming("t1", 1))?;
        txn.archive_thread("t1", None)?;
        Ok(())
    })
    .unwrap();
    db.read(|txn| {
        assert_eq!(txn.archived_thread_ids()?, vec!["t1"]);
        assert!(txn.inbox_thread_ids()?.is_empty());
        Ok(())
    })
    .unwrap();

    db.write(|txn| txn.unarchive_thread("t1")).unwrap();
    db.read(|txn| {
        assert_eq!(txn.inbox_thread_ids()?, vec!["t1"]);
        assert!(txn.archived_thread_ids()?.is_empty());
        assert!(txn.thread("t1")?.unwrap().archival_date.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn unread_scenario_orders_and_clears() {
    let (_dir, db) = open_store();
    let subscription = db.subscribe().unwrap();
    let (late, early) = db
        .write(|txn| {
            txn.get_or_create_thread("T1")?;
            let late = incoming("T1", 100);
            let early = incoming("T1", 50);
            txn.save_message(&late)?;
            txn.save_message(&early)?;
            Ok((late.unique_id, early.unique_id))
        })
        .unwrap();

    db.read(|txn| {
        assert_eq!(txn.interaction_ids("T1")?, vec![early.clone(), late.clone()]);
        assert_eq!(txn.unread_count("T1")?, 2);
        assert_eq!(txn.unseen_count("T1")?, 2);
        Ok(())
    })
    .unwrap();

    db.write(|txn| txn.mark_all_read("T1")).unwrap();
    db.read(|txn| {
        assert_eq!(txn.unread_count("T1")?, 0);
        assert_eq!(txn.unseen_count("T1")?, 0);
        Ok(())
    })
    .unwrap();

    // One notification per commit, in commit order.
    let first = subscription.try_recv().unwrap();
    let second = subscription.try_recv().unwrap();
    assert!(first.commit_seq < second.commit_seq);
    assert!(second.touches_view(relay_store::views::builtin::UNSEEN));
    assert!(subscription.try_recv().is_none());
}

#[test]
fn arming_timer_twice_keeps_first_start() {
    let (_dir, db) = open_store();
    let id = db
        .write(|txn| {
            txn.get_or_create_thread("t1")?;
            let message = incoming("t1", 1).with_expiration(30);
            txn.save_message(&message)?;
            assert!(txn.update_expire_started_at(&message.unique_id, 1_000)?);
            assert!(!txn.update_expire_started_at(&message.unique_id, 2_000)?);
            Ok(message.unique_id)
        })
        .unwrap();

    let stored = db.read(|txn| txn.message(&id)).unwrap().unwrap();
    assert_eq!(stored.expire_started_at, 1_000);
}

#[test]
fn unseen_falls_back_to_unread_without_its_view() {
    use relay_store::views::builtin::{builtin_views, THREADS, THREAD_INTERACTIONS, UNREAD, UNSEEN};
    use relay_store::UnseenPolicy;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in(dir.path(), StoreOptions::default()).unwrap();
    for view in builtin_views(UnseenPolicy::default()) {
        if [THREAD_INTERACTIONS, THREADS, UNREAD].contains(&view.name()) {
            db.register_view_blocking(view).unwrap();
        }
    }

    db.write(|txn| {
        txn.get_or_create_thread("T1")?;
        txn.save_message(&incoming("T1", 10))
    })
    .unwrap();

    assert!(db.is_view_ready(UNREAD));
    assert!(!db.is_view_ready(UNSEEN));
    db.read(|txn| {
        assert!(!txn.is_view_ready(UNSEEN));
        assert_eq!(txn.unread_count("T1")?, 1);
        assert_eq!(txn.unseen_count("T1")?, 1);
        assert_eq!(txn.unseen_ids("T1")?, txn.unread_ids("T1")?);
        Ok(())
    })
    .unwrap();
}
