//! Engine integration tests: the full pool → container → object → value
//! chain, epoch resolution, punches, enumeration, maintenance passes, and
//! distributed transactions.

use std::path::PathBuf;
use tempfile::{tempdir, TempDir};
use vostok_core::{ContId, Epoch, KeyBuf, ObjId, ObjType, PoolId, VosError};
use vostok_engine::{
    AkeyUpdate, CondFlags, ContainerHandle, DtxVerdict, ObjectHandle, OpenMode, PoolConfig,
    PoolHandle, QueryFlags, UpdatePayload,
};

// Handles first: the pool must close (and checkpoint) before the
// directory disappears.
struct Fixture {
    cont: ContainerHandle,
    pool: PoolHandle,
    path: PathBuf,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.pool");
    PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()).unwrap();
    let pool = PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing())
        .unwrap();
    let cont_id = ContId::new();
    pool.create_container(cont_id).unwrap();
    let cont = pool.open_container(cont_id).unwrap();
    Fixture {
        cont,
        pool,
        path,
        _dir: dir,
    }
}

fn obj(cont: &ContainerHandle, lo: u64) -> ObjectHandle {
    cont.object(ObjId::new(ObjType::MultiHashed, 0, 0, 0, lo))
        .unwrap()
}

fn put_single(
    o: &ObjectHandle,
    dkey: &str,
    akey: &str,
    value: &str,
    epoch: u64,
) -> vostok_core::Result<()> {
    o.update(
        &KeyBuf::from(dkey),
        &[AkeyUpdate::single(akey, value.as_bytes().to_vec())],
        Epoch(epoch),
        CondFlags::default(),
        None,
    )
}

fn get_single(o: &ObjectHandle, dkey: &str, akey: &str, epoch: u64) -> vostok_core::Result<Vec<u8>> {
    o.fetch_single(&KeyBuf::from(dkey), &KeyBuf::from(akey), Epoch(epoch), None)
}

// =============================================================================
// Containers
// =============================================================================

#[test]
fn container_lifecycle_and_query() {
    let fx = fixture();
    let info = fx.cont.query().unwrap();
    assert_eq!(info.nobjs, 0);
    assert_eq!(info.used, 0);

    // Duplicate create fails, open of a missing container fails.
    assert!(matches!(
        fx.pool.create_container(fx.cont.id()),
        Err(VosError::PrecondFail)
    ));
    assert!(matches!(
        fx.pool.open_container(ContId::new()),
        Err(VosError::NoKey)
    ));

    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "hello", 10).unwrap();
    let info = fx.cont.query().unwrap();
    assert_eq!(info.nobjs, 1);
    assert_eq!(info.used, 5);

    fx.pool.destroy_container(fx.cont.id()).unwrap();
    assert!(matches!(
        fx.pool.open_container(fx.cont.id()),
        Err(VosError::NoKey)
    ));
}

#[test]
fn container_destroy_releases_space() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    for i in 0..50u64 {
        put_single(&o, "d", &format!("a{}", i), "payload-payload", 10 + i).unwrap();
    }
    let used_with_data = fx.pool.query().used;
    fx.pool.destroy_container(fx.cont.id()).unwrap();
    assert!(fx.pool.query().used < used_with_data);
}

// =============================================================================
// Single values
// =============================================================================

#[test]
fn epoch_ladder_resolution() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v1", 10).unwrap();
    put_single(&o, "d", "a", "v2", 20).unwrap();
    put_single(&o, "d", "a", "v3", 30).unwrap();

    assert_eq!(get_single(&o, "d", "a", 15).unwrap(), b"v1");
    assert_eq!(get_single(&o, "d", "a", 25).unwrap(), b"v2");
    assert_eq!(get_single(&o, "d", "a", 30).unwrap(), b"v3");
    assert_eq!(get_single(&o, "d", "a", 1000).unwrap(), b"v3");
    assert!(matches!(
        get_single(&o, "d", "a", 5),
        Err(VosError::NoKey)
    ));
}

#[test]
fn same_epoch_overwrite_conflicts() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "first", 10).unwrap();
    assert!(matches!(
        put_single(&o, "d", "a", "second", 10),
        Err(VosError::Conflict)
    ));
    // The loser left nothing behind.
    assert_eq!(get_single(&o, "d", "a", 10).unwrap(), b"first");

    // Distinct akeys at the same epoch are independent.
    put_single(&o, "d", "b", "other", 10).unwrap();
}

#[test]
fn truncated_sink_reports_needed_size() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "0123456789", 10).unwrap();
    let r = o.fetch_single(&KeyBuf::from("d"), &KeyBuf::from("a"), Epoch(10), Some(4));
    assert!(matches!(
        r,
        Err(VosError::Trunc {
            needed: 10,
            provided: 4
        })
    ));
    // A big enough sink succeeds.
    o.fetch_single(&KeyBuf::from("d"), &KeyBuf::from("a"), Epoch(10), Some(10))
        .unwrap();
}

#[test]
fn conditional_akey_flags() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    let insert = CondFlags {
        insert_akey: true,
        ..Default::default()
    };
    let update = CondFlags {
        update_akey: true,
        ..Default::default()
    };

    // update-only on a missing akey.
    let r = o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::single("a", b"x".to_vec())],
        Epoch(50),
        update,
        None,
    );
    assert!(matches!(r, Err(VosError::NoKey)));

    // First conditional insert wins, second loses, winner's value stays.
    o.update(
        &KeyBuf::from("d2"),
        &[AkeyUpdate::single("a2", b"p1".to_vec())],
        Epoch(50),
        insert,
        None,
    )
    .unwrap();
    let r = o.update(
        &KeyBuf::from("d2"),
        &[AkeyUpdate::single("a2", b"p2".to_vec())],
        Epoch(50),
        insert,
        None,
    );
    assert!(matches!(
        r,
        Err(VosError::PrecondFail) | Err(VosError::Conflict)
    ));
    assert_eq!(get_single(&o, "d2", "a2", 50).unwrap(), b"p1");

    // update-only now passes at a later epoch.
    o.update(
        &KeyBuf::from("d2"),
        &[AkeyUpdate::single("a2", b"p3".to_vec())],
        Epoch(60),
        update,
        None,
    )
    .unwrap();
}

#[test]
fn conditional_dkey_flags() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v", 10).unwrap();

    let insert_dkey = CondFlags {
        insert_dkey: true,
        ..Default::default()
    };
    let r = o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::single("b", b"x".to_vec())],
        Epoch(20),
        insert_dkey,
        None,
    );
    assert!(matches!(r, Err(VosError::PrecondFail)));

    let update_dkey = CondFlags {
        update_dkey: true,
        ..Default::default()
    };
    let r = o.update(
        &KeyBuf::from("missing"),
        &[AkeyUpdate::single("b", b"x".to_vec())],
        Epoch(20),
        update_dkey,
        None,
    );
    assert!(matches!(r, Err(VosError::NoKey)));
}

#[test]
fn kind_is_fixed_on_first_write() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "single", 10).unwrap();

    // Writing an array under a single-value akey is refused.
    let r = o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("a", 1, 0, b"AAAA".to_vec())],
        Epoch(20),
        CondFlags::default(),
        None,
    );
    assert!(matches!(r, Err(VosError::InvalKind)));

    // And array fetch of a single-value akey is refused.
    let r = o.fetch_array(&KeyBuf::from("d"), &KeyBuf::from("a"), Epoch(20), 0, 4);
    assert!(matches!(r, Err(VosError::InvalKind)));
}

// =============================================================================
// Punches
// =============================================================================

#[test]
fn punch_hides_older_not_newer() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v1", 10).unwrap();
    put_single(&o, "d", "a", "v2", 20).unwrap();
    put_single(&o, "d", "a", "v3", 30).unwrap();

    o.punch_akeys(&KeyBuf::from("d"), &[KeyBuf::from("a")], Epoch(25), None)
        .unwrap();

    assert!(matches!(get_single(&o, "d", "a", 25), Err(VosError::NoKey)));
    assert!(matches!(get_single(&o, "d", "a", 27), Err(VosError::NoKey)));
    assert_eq!(get_single(&o, "d", "a", 30).unwrap(), b"v3");
    assert_eq!(get_single(&o, "d", "a", 20).unwrap(), b"v2");
}

#[test]
fn dkey_and_object_punch_shadow_below() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v1", 10).unwrap();
    put_single(&o, "d", "b", "w1", 10).unwrap();

    o.punch_dkey(&KeyBuf::from("d"), Epoch(20), None).unwrap();
    assert!(matches!(get_single(&o, "d", "a", 25), Err(VosError::NoKey)));
    assert!(matches!(get_single(&o, "d", "b", 25), Err(VosError::NoKey)));
    assert_eq!(get_single(&o, "d", "a", 15).unwrap(), b"v1");

    // Re-create after the punch; then punch the whole object.
    put_single(&o, "d", "a", "v2", 30).unwrap();
    assert_eq!(get_single(&o, "d", "a", 35).unwrap(), b"v2");
    o.punch_object(Epoch(40), None).unwrap();
    assert!(matches!(get_single(&o, "d", "a", 45), Err(VosError::NoKey)));
    assert_eq!(get_single(&o, "d", "a", 35).unwrap(), b"v2");
}

#[test]
fn punch_missing_key_fails() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    assert!(matches!(
        o.punch_dkey(&KeyBuf::from("none"), Epoch(10), None),
        Err(VosError::NoKey)
    ));
    put_single(&o, "d", "a", "v", 10).unwrap();
    assert!(matches!(
        o.punch_akeys(&KeyBuf::from("d"), &[KeyBuf::from("nope")], Epoch(20), None),
        Err(VosError::NoKey)
    ));
    // Same-epoch punch over an update conflicts.
    assert!(matches!(
        o.punch_akeys(&KeyBuf::from("d"), &[KeyBuf::from("a")], Epoch(10), None),
        Err(VosError::Conflict)
    ));
}

// =============================================================================
// Arrays
// =============================================================================

#[test]
fn extent_overwrite_resolves_by_epoch() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 1, 0, b"AAAA".to_vec())],
        Epoch(100),
        CondFlags::default(),
        None,
    )
    .unwrap();
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 1, 1, b"Z".to_vec())],
        Epoch(200),
        CondFlags::default(),
        None,
    )
    .unwrap();

    let at100 = o
        .fetch_array(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(100), 0, 4)
        .unwrap();
    assert_eq!(at100.data, b"AAAA");
    assert!(at100.holes.is_empty());

    let at200 = o
        .fetch_array(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(200), 0, 4)
        .unwrap();
    assert_eq!(at200.data, b"AZAA");
    assert_eq!(at200.committed, Some((0, 3)));
}

#[test]
fn array_holes_are_reported() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate {
            akey: KeyBuf::from("x"),
            payload: UpdatePayload::Array {
                rsize: 2,
                extents: vec![(2, b"aabb".to_vec()), (8, b"cc".to_vec())],
            },
            flags: None,
        }],
        Epoch(10),
        CondFlags::default(),
        None,
    )
    .unwrap();

    let fetch = o
        .fetch_array(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(10), 0, 10)
        .unwrap();
    assert_eq!(fetch.rsize, 2);
    assert_eq!(&fetch.data[4..8], b"aabb");
    assert_eq!(&fetch.data[16..18], b"cc");
    assert_eq!(fetch.holes, vec![(0, 2), (4, 4), (9, 1)]);
    assert_eq!(fetch.committed, Some((2, 8)));
}

#[test]
fn record_size_is_fixed_per_akey() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 4, 0, vec![0u8; 16])],
        Epoch(10),
        CondFlags::default(),
        None,
    )
    .unwrap();

    let r = o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 8, 0, vec![0u8; 16])],
        Epoch(20),
        CondFlags::default(),
        None,
    );
    assert!(matches!(
        r,
        Err(VosError::InvalRecSize {
            expected: 4,
            got: 8
        })
    ));
}

#[test]
fn same_epoch_overlapping_extents_conflict() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 1, 0, b"aaaa".to_vec())],
        Epoch(10),
        CondFlags::default(),
        None,
    )
    .unwrap();

    // Overlap at the same epoch.
    let r = o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 1, 2, b"bb".to_vec())],
        Epoch(10),
        CondFlags::default(),
        None,
    );
    assert!(matches!(r, Err(VosError::Conflict)));

    // Disjoint at the same epoch is fine.
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 1, 4, b"bb".to_vec())],
        Epoch(10),
        CondFlags::default(),
        None,
    )
    .unwrap();
}

#[test]
fn extent_punch_masks_range() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 1, 0, b"abcdef".to_vec())],
        Epoch(10),
        CondFlags::default(),
        None,
    )
    .unwrap();
    o.punch_extent(&KeyBuf::from("d"), &KeyBuf::from("x"), 2, 2, Epoch(20), None)
        .unwrap();

    let at20 = o
        .fetch_array(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(20), 0, 6)
        .unwrap();
    assert_eq!(&at20.data[0..2], b"ab");
    assert_eq!(&at20.data[4..6], b"ef");
    assert_eq!(at20.holes, vec![(2, 2)]);

    // Below the punch everything is intact.
    let at10 = o
        .fetch_array(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(10), 0, 6)
        .unwrap();
    assert_eq!(at10.data, b"abcdef");
}

// =============================================================================
// Listing and query
// =============================================================================

#[test]
fn list_dkeys_in_batches_with_anchor() {
    let fx = fixture();
    let o = fx
        .cont
        .object(ObjId::new(ObjType::MultiLexical, 0, 0, 0, 7))
        .unwrap();
    for i in 0..250 {
        put_single(&o, &format!("k{:04}", i), "a", "v", 1).unwrap();
    }

    let mut all = Vec::new();
    let mut anchor: Option<Vec<u8>> = None;
    loop {
        let (batch, next) = o
            .list_dkeys(Epoch(1), anchor.as_deref(), 100)
            .unwrap();
        all.extend(batch);
        match next {
            Some(a) => anchor = Some(a),
            None => break,
        }
    }
    assert_eq!(all.len(), 250);
    let expected: Vec<KeyBuf> = (0..250)
        .map(|i| KeyBuf::from(format!("k{:04}", i).as_str()))
        .collect();
    assert_eq!(all, expected);
}

#[test]
fn listing_respects_snapshot_epoch() {
    let fx = fixture();
    let o = fx
        .cont
        .object(ObjId::new(ObjType::MultiLexical, 0, 0, 0, 7))
        .unwrap();
    put_single(&o, "early", "a", "v", 10).unwrap();
    put_single(&o, "late", "a", "v", 30).unwrap();

    let (at20, _) = o.list_dkeys(Epoch(20), None, 100).unwrap();
    assert_eq!(at20, vec![KeyBuf::from("early")]);

    let (at30, _) = o.list_dkeys(Epoch(30), None, 100).unwrap();
    assert_eq!(at30.len(), 2);

    // A punched dkey disappears from enumeration above the punch.
    o.punch_dkey(&KeyBuf::from("early"), Epoch(40), None).unwrap();
    let (at50, _) = o.list_dkeys(Epoch(50), None, 100).unwrap();
    assert_eq!(at50, vec![KeyBuf::from("late")]);
}

#[test]
fn list_akeys_and_recx() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    o.update(
        &KeyBuf::from("d"),
        &[
            AkeyUpdate::single("s", b"v".to_vec()),
            AkeyUpdate::extent("x", 1, 4, b"1234".to_vec()),
        ],
        Epoch(10),
        CondFlags::default(),
        None,
    )
    .unwrap();
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::extent("x", 1, 20, b"56".to_vec())],
        Epoch(11),
        CondFlags::default(),
        None,
    )
    .unwrap();

    let (akeys, _) = o
        .list_akeys(&KeyBuf::from("d"), Epoch(20), None, 10)
        .unwrap();
    assert_eq!(akeys.len(), 2);

    let (recx, next) = o
        .list_recx(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(20), None, 10)
        .unwrap();
    assert!(next.is_none());
    assert_eq!(recx.len(), 2);
    assert_eq!((recx[0].start, recx[0].nr), (4, 4));
    assert_eq!((recx[1].start, recx[1].nr), (20, 2));
}

#[test]
fn integer_keys_enumerate_numerically() {
    let fx = fixture();
    let o = fx
        .cont
        .object(ObjId::new(ObjType::MultiUint64, 0, 0, 0, 9))
        .unwrap();
    for k in [300u64, 2, 100_000, 41] {
        o.update(
            &KeyBuf::Uint(k),
            &[AkeyUpdate::single(7u64, b"v".to_vec())],
            Epoch(5),
            CondFlags::default(),
            None,
        )
        .unwrap();
    }
    let (keys, _) = o.list_dkeys(Epoch(5), None, 10).unwrap();
    assert_eq!(
        keys,
        vec![
            KeyBuf::Uint(2),
            KeyBuf::Uint(41),
            KeyBuf::Uint(300),
            KeyBuf::Uint(100_000)
        ]
    );
}

#[test]
fn query_extremes() {
    let fx = fixture();
    let o = fx
        .cont
        .object(ObjId::new(ObjType::MultiLexical, 0, 0, 0, 3))
        .unwrap();
    for dkey in ["alpha", "omega", "mid"] {
        o.update(
            &KeyBuf::from(dkey),
            &[AkeyUpdate::extent("arr", 1, 5, b"12345".to_vec())],
            Epoch(10),
            CondFlags::default(),
            None,
        )
        .unwrap();
    }

    let q = o
        .query(
            QueryFlags {
                dkey_max: true,
                akey_max: true,
                recx_max: true,
                max_epoch: true,
                ..Default::default()
            },
            Epoch(100),
        )
        .unwrap();
    assert_eq!(q.dkey, Some(KeyBuf::from("omega")));
    assert_eq!(q.akey, Some(KeyBuf::from("arr")));
    assert_eq!(q.recx, Some((5, 5)));
    assert_eq!(q.max_epoch, Some(Epoch(10)));

    let q = o
        .query(
            QueryFlags {
                dkey_min: true,
                ..Default::default()
            },
            Epoch(100),
        )
        .unwrap();
    assert_eq!(q.dkey, Some(KeyBuf::from("alpha")));

    // min and max together are rejected.
    assert!(matches!(
        o.query(
            QueryFlags {
                dkey_min: true,
                dkey_max: true,
                ..Default::default()
            },
            Epoch(100)
        ),
        Err(VosError::InvalArg(_))
    ));
}

// =============================================================================
// Object index
// =============================================================================

#[test]
fn object_type_field_is_closed() {
    let fx = fixture();
    let mut oid = ObjId::new(ObjType::MultiHashed, 0, 0, 0, 1);
    oid.hi |= 77u64 << 32;
    assert!(matches!(fx.cont.object(oid), Err(VosError::InvalType(_))));
}

#[test]
fn list_objects_and_marks() {
    let fx = fixture();
    let oids: Vec<ObjId> = (1..=5)
        .map(|i| ObjId::new(ObjType::MultiHashed, 0, 0, 0, i))
        .collect();
    for oid in &oids {
        let o = fx.cont.object(*oid).unwrap();
        put_single(&o, "d", "a", "v", 10).unwrap();
    }

    let (batch, next) = fx.cont.list_objects(Epoch(10), None, 3).unwrap();
    assert_eq!(batch.len(), 3);
    let (rest, done) = fx
        .cont
        .list_objects(Epoch(10), next.as_deref(), 10)
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert!(done.is_none());

    // Nothing is visible below the first write epoch.
    let (empty, _) = fx.cont.list_objects(Epoch(5), None, 10).unwrap();
    assert!(empty.is_empty());

    // Marks persist until cleared and cap at 32 bytes.
    fx.cont.mark_object(oids[0], b"seen").unwrap();
    assert_eq!(fx.cont.object_mark(oids[0]).unwrap(), Some(b"seen".to_vec()));
    assert!(matches!(
        fx.cont.mark_object(oids[0], &[0u8; 33]),
        Err(VosError::InvalArg(_))
    ));
    fx.cont.clear_mark(oids[0]).unwrap();
    assert_eq!(fx.cont.object_mark(oids[0]).unwrap(), None);
}

// =============================================================================
// Aggregation and discard
// =============================================================================

#[test]
fn aggregation_drops_shadowed_history() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v40", 40).unwrap();
    put_single(&o, "d", "a", "v45", 45).unwrap();
    fx.cont.snap_create(Epoch(50)).unwrap();

    let dropped = fx.cont.aggregate(Epoch(1), Epoch(49)).unwrap();
    assert_eq!(dropped, 1);
    assert_eq!(get_single(&o, "d", "a", 50).unwrap(), b"v45");

    // Idempotent.
    assert_eq!(fx.cont.aggregate(Epoch(1), Epoch(49)).unwrap(), 0);
}

#[test]
fn aggregation_preserves_pinned_snapshots() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v10", 10).unwrap();
    put_single(&o, "d", "a", "v20", 20).unwrap();
    put_single(&o, "d", "a", "v30", 30).unwrap();
    fx.cont.snap_create(Epoch(15)).unwrap();

    fx.cont.aggregate(Epoch(1), Epoch(29)).unwrap();
    // v10 is pinned by the snapshot at 15; v20's successor lies outside
    // the window, so it survives too.
    assert_eq!(get_single(&o, "d", "a", 15).unwrap(), b"v10");
    assert_eq!(get_single(&o, "d", "a", 100).unwrap(), b"v30");

    // Dropping the snapshot lets the next pass reclaim v10.
    fx.cont.snap_destroy(Epoch(15)).unwrap();
    let dropped = fx.cont.aggregate(Epoch(1), Epoch(29)).unwrap();
    assert!(dropped >= 1);
    assert_eq!(get_single(&o, "d", "a", 100).unwrap(), b"v30");
}

#[test]
fn aggregation_coalesces_adjacent_extents() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate {
            akey: KeyBuf::from("x"),
            payload: UpdatePayload::Array {
                rsize: 1,
                extents: vec![(0, b"aa".to_vec()), (2, b"bb".to_vec()), (4, b"cc".to_vec())],
            },
            flags: None,
        }],
        Epoch(10),
        CondFlags::default(),
        None,
    )
    .unwrap();

    fx.cont.aggregate(Epoch(1), Epoch(20)).unwrap();

    let (recx, _) = o
        .list_recx(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(20), None, 10)
        .unwrap();
    assert_eq!(recx.len(), 1);
    assert_eq!((recx[0].start, recx[0].nr), (0, 6));

    let fetch = o
        .fetch_array(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(20), 0, 6)
        .unwrap();
    assert_eq!(fetch.data, b"aabbcc");
}

#[test]
fn discard_rolls_an_epoch_range_back() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "keep", 10).unwrap();
    put_single(&o, "d", "a", "drop1", 20).unwrap();
    put_single(&o, "d", "a", "drop2", 25).unwrap();

    let removed = fx.cont.discard(Epoch(15), Epoch(29)).unwrap();
    assert_eq!(removed, 2);
    assert_eq!(get_single(&o, "d", "a", 100).unwrap(), b"keep");
}

#[test]
fn discard_removes_punch_tombstones_too() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v", 10).unwrap();
    o.punch_akeys(&KeyBuf::from("d"), &[KeyBuf::from("a")], Epoch(20), None)
        .unwrap();
    assert!(matches!(get_single(&o, "d", "a", 30), Err(VosError::NoKey)));

    fx.cont.discard(Epoch(20), Epoch(20)).unwrap();
    assert_eq!(get_single(&o, "d", "a", 30).unwrap(), b"v");
}

#[test]
fn discarding_everything_removes_the_object() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v", 10).unwrap();
    assert_eq!(fx.cont.query().unwrap().nobjs, 1);

    fx.cont.discard(Epoch(1), Epoch(100)).unwrap();
    assert_eq!(fx.cont.query().unwrap().nobjs, 0);
    let (objs, _) = fx.cont.list_objects(Epoch(100), None, 10).unwrap();
    assert!(objs.is_empty());
}

// =============================================================================
// Distributed transactions
// =============================================================================

#[test]
fn dtx_commit_makes_writes_visible() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    let dtx = fx.pool.dtx_open().unwrap();
    let epoch = dtx.leader_epoch;
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::single("a", b"staged".to_vec())],
        epoch,
        CondFlags::default(),
        Some(dtx),
    )
    .unwrap();

    // Before commit the write is invisible (no resolver installed means
    // the read at its epoch cannot proceed; below it there is nothing).
    assert!(matches!(
        o.fetch_single(&KeyBuf::from("d"), &KeyBuf::from("a"), epoch, None),
        Err(VosError::Timeout)
    ));

    fx.pool.dtx_commit(dtx).unwrap();
    assert_eq!(
        o.fetch_single(&KeyBuf::from("d"), &KeyBuf::from("a"), epoch, None)
            .unwrap(),
        b"staged"
    );
}

#[test]
fn dtx_abort_cancels_and_reclaims() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "base", 1).unwrap();

    let dtx = fx.pool.dtx_open().unwrap();
    let epoch = dtx.leader_epoch;
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::single("a", b"doomed".to_vec())],
        epoch,
        CondFlags::default(),
        Some(dtx),
    )
    .unwrap();
    fx.pool.dtx_abort(dtx).unwrap();

    // Aborted writes are invisible and further writes under the dtx are
    // canceled.
    assert_eq!(
        o.fetch_single(&KeyBuf::from("d"), &KeyBuf::from("a"), epoch, None)
            .unwrap(),
        b"base"
    );
    let r = o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::single("a", b"again".to_vec())],
        Epoch(epoch.0 + 1),
        CondFlags::default(),
        Some(dtx),
    );
    assert!(matches!(r, Err(VosError::Canceled)));

    // The reclaim pass physically removes the aborted record.
    let removed = fx.pool.reclaim_aborted().unwrap();
    assert_eq!(removed, 1);
    assert_eq!(
        o.fetch_single(&KeyBuf::from("d"), &KeyBuf::from("a"), epoch, None)
            .unwrap(),
        b"base"
    );
}

#[test]
fn pending_dtx_resolves_through_callback() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    let dtx = fx.pool.dtx_open().unwrap();
    let epoch = dtx.leader_epoch;
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::single("a", b"maybe".to_vec())],
        epoch,
        CondFlags::default(),
        Some(dtx),
    )
    .unwrap();

    fx.pool.set_dtx_resolver(Box::new(|_| DtxVerdict::Commit));
    // The read forces resolution and then proceeds.
    assert_eq!(
        o.fetch_single(&KeyBuf::from("d"), &KeyBuf::from("a"), epoch, None)
            .unwrap(),
        b"maybe"
    );
    // The transaction is already resolved; a second commit is invalid.
    assert!(matches!(fx.pool.dtx_commit(dtx), Err(VosError::InvalState(_))));
}

#[test]
fn aggregation_refuses_pending_dtx_window() {
    let fx = fixture();
    let o = obj(&fx.cont, 1);
    put_single(&o, "d", "a", "v", 5).unwrap();

    let dtx = fx.pool.dtx_open().unwrap();
    let epoch = dtx.leader_epoch;
    o.update(
        &KeyBuf::from("d"),
        &[AkeyUpdate::single("b", b"w".to_vec())],
        epoch,
        CondFlags::default(),
        Some(dtx),
    )
    .unwrap();

    assert!(matches!(
        fx.cont.aggregate(Epoch(1), epoch),
        Err(VosError::Busy)
    ));
    assert!(matches!(
        fx.cont.discard(Epoch(1), epoch),
        Err(VosError::Busy)
    ));

    fx.pool.dtx_commit(dtx).unwrap();
    fx.cont.aggregate(Epoch(1), epoch).unwrap();
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn state_survives_reopen() {
    let fx = fixture();
    let oid = ObjId::new(ObjType::MultiHashed, 0, 0, 0, 1);
    {
        let o = fx.cont.object(oid).unwrap();
        put_single(&o, "d", "a", "v1", 10).unwrap();
        put_single(&o, "d", "a", "v2", 20).unwrap();
        o.punch_akeys(&KeyBuf::from("d"), &[KeyBuf::from("a")], Epoch(15), None)
            .unwrap();
        o.update(
            &KeyBuf::from("d"),
            &[AkeyUpdate::extent("x", 1, 0, b"bytes".to_vec())],
            Epoch(30),
            CondFlags::default(),
            None,
        )
        .unwrap();
    }
    let cont_id = fx.cont.id();
    let path = fx.path.clone();
    drop(fx.cont);
    drop(fx.pool);

    let pool = PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing())
        .unwrap();
    let cont = pool.open_container(cont_id).unwrap();
    let o = cont.object(oid).unwrap();

    assert_eq!(get_single(&o, "d", "a", 12).unwrap(), b"v1");
    assert!(matches!(get_single(&o, "d", "a", 15), Err(VosError::NoKey)));
    assert_eq!(get_single(&o, "d", "a", 25).unwrap(), b"v2");
    let arr = o
        .fetch_array(&KeyBuf::from("d"), &KeyBuf::from("x"), Epoch(30), 0, 5)
        .unwrap();
    assert_eq!(arr.data, b"bytes");
}

fn _assert_send_handles(p: PoolHandle) {
    fn is_send<T: Send>(_: &T) {}
    is_send(&p);
}
