//! End-to-end behaviour of the handle map against real shard stores.

use fhmap::{select_shard, Digest, HandleMap, MapError, ShardStore};
use fhmap_config::testing::TestEnvironment;

const MAP_SIZE: usize = 16 * 1024 * 1024;

#[test]
fn test_restart_scenario_four_shards() {
    let env = TestEnvironment::new().unwrap();
    let config = env.config(4);
    let d = Digest::new(100, 7);

    {
        let map = HandleMap::init(&config).unwrap();
        map.set_fh(&d, &[0xAA, 0xBB, 0xCC]).unwrap();
        // visible before any store write
        assert_eq!(map.get_fh(&d).unwrap(), vec![0xAA, 0xBB, 0xCC]);
        map.flush();
    }

    assert_eq!(fhmap::count_shard_files(&env.storage_dir).unwrap(), 4);

    let map = HandleMap::init(&config).unwrap();
    assert_eq!(map.get_fh(&d).unwrap(), vec![0xAA, 0xBB, 0xCC]);
    assert_eq!(map.len(), 1);
}

#[test]
fn test_row_lands_in_routed_shard_only() {
    let env = TestEnvironment::new().unwrap();
    let config = env.config(4);
    let d = Digest::new(100, 7);
    let owner = select_shard(&d, 4);
    assert_eq!(owner, 1);

    let map = HandleMap::init(&config).unwrap();
    assert_eq!(map.shard_of(&d), owner);
    map.set_fh(&d, &[0xAA, 0xBB, 0xCC]).unwrap();
    map.shutdown();

    for i in 0..4 {
        let store = ShardStore::open(&env.storage_dir, i, MAP_SIZE).unwrap();
        let row = store.get(&d, 128).unwrap();
        if i == owner {
            assert_eq!(row, Some(vec![0xAA, 0xBB, 0xCC]));
        } else {
            assert_eq!(row, None, "shard {} holds a foreign row", i);
        }
    }
}

#[test]
fn test_never_set_is_stale() {
    let env = TestEnvironment::new().unwrap();
    let map = HandleMap::init(&env.config(2)).unwrap();
    for oid in 0..50u64 {
        let d = Digest::new(oid, 1);
        assert!(matches!(map.get_fh(&d), Err(MapError::Stale)));
    }
}

#[test]
fn test_second_set_is_exists() {
    let env = TestEnvironment::new().unwrap();
    let d = Digest::new(5, 6);
    {
        let map = HandleMap::init(&env.config(2)).unwrap();
        map.set_fh(&d, b"h1").unwrap();
        assert!(matches!(map.set_fh(&d, b"h2"), Err(MapError::Exists)));
        assert_eq!(map.get_fh(&d).unwrap(), b"h1");
        map.flush();
    }

    let map = HandleMap::init(&env.config(2)).unwrap();
    assert_eq!(map.get_fh(&d).unwrap(), b"h1");
}

#[test]
fn test_delete_is_immediate_and_durable() {
    let env = TestEnvironment::new().unwrap();
    let keep = Digest::new(1, 1);
    let gone = Digest::new(2, 2);
    {
        let map = HandleMap::init(&env.config(2)).unwrap();
        map.set_fh(&keep, b"keep").unwrap();
        map.set_fh(&gone, b"gone").unwrap();
        map.del_fh(&gone).unwrap();
        assert!(matches!(map.get_fh(&gone), Err(MapError::Stale)));
        map.flush();
    }

    let map = HandleMap::init(&env.config(2)).unwrap();
    assert_eq!(map.get_fh(&keep).unwrap(), b"keep");
    assert!(matches!(map.get_fh(&gone), Err(MapError::Stale)));
}

#[test]
fn test_delete_then_reinsert_reads_new_value() {
    let env = TestEnvironment::new().unwrap();
    let map = HandleMap::init(&env.config(4)).unwrap();
    let d = Digest::new(42, 4242);

    map.set_fh(&d, b"X").unwrap();
    map.del_fh(&d).unwrap();
    map.set_fh(&d, b"Y").unwrap();
    assert_eq!(map.get_fh(&d).unwrap(), b"Y");

    // serialized with flushes, the store follows as well
    map.flush();
    map.del_fh(&d).unwrap();
    map.flush();
    map.set_fh(&d, b"Z").unwrap();
    map.shutdown();

    let map = HandleMap::init(&env.config(4)).unwrap();
    assert_eq!(map.get_fh(&d).unwrap(), b"Z");
}

#[test]
fn test_shard_count_mismatch_refused() {
    let env = TestEnvironment::new().unwrap();
    {
        let map = HandleMap::init(&env.config(4)).unwrap();
        map.set_fh(&Digest::new(1, 2), b"x").unwrap();
    }

    let err = HandleMap::init(&env.config(2)).err().unwrap();
    assert!(matches!(err, MapError::InvalidParam(_)), "got {:?}", err);

    // the original layout still opens
    let map = HandleMap::init(&env.config(4)).unwrap();
    assert_eq!(map.len(), 1);
}

#[test]
fn test_gapped_shard_files_refused() {
    let env = TestEnvironment::new().unwrap();
    for name in ["handlemap.0", "handlemap.1", "handlemap.5"] {
        env.create_file(name, b"").unwrap();
    }

    let err = HandleMap::init(&env.config(3)).err().unwrap();
    assert!(matches!(err, MapError::InvalidParam(_)), "got {:?}", err);
}

#[test]
fn test_unrelated_files_do_not_count_as_shards() {
    let env = TestEnvironment::new().unwrap();
    env.create_file("README", b"notes").unwrap();
    env.create_file("handlemap.backup", b"old").unwrap();

    let map = HandleMap::init(&env.config(3)).unwrap();
    assert_eq!(map.shard_count(), 3);
}

#[test]
fn test_malformed_rows_skipped_on_load() {
    let env = TestEnvironment::new().unwrap();
    let config = env.config(1);
    let good = Digest::new(10, 10);
    {
        let map = HandleMap::init(&config).unwrap();
        map.set_fh(&good, &[1, 2, 3]).unwrap();
    }
    {
        let store = ShardStore::open(&env.storage_dir, 0, MAP_SIZE).unwrap();
        store.insert(&Digest::new(11, 11), b"abc").unwrap();
        store.insert(&Digest::new(12, 12), b"nothex").unwrap();
        let oversize = "00".repeat(config.max_handle_size + 1);
        store.insert(&Digest::new(13, 13), oversize.as_bytes()).unwrap();
    }

    let map = HandleMap::init(&config).unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map.get_fh(&good).unwrap(), vec![1, 2, 3]);
    assert!(matches!(map.get_fh(&Digest::new(11, 11)), Err(MapError::Stale)));
}

#[test]
fn test_wire_digest_lookup() {
    let env = TestEnvironment::new().unwrap();
    let map = HandleMap::init(&env.config(2)).unwrap();
    let handle = b"\x01\x02\x03\x04backend";
    let d = Digest::for_handle(900, handle);
    map.set_fh(&d, handle).unwrap();

    let wire = d.to_wire();
    let decoded = Digest::from_wire(&wire).unwrap();
    assert_eq!(map.get_fh(&decoded).unwrap(), handle);
}

#[test]
fn test_synchronous_insert_is_accepted() {
    let env = TestEnvironment::new().unwrap();
    let mut config = env.config(1);
    config.synchronous_insert = true;
    let map = HandleMap::init(&config).unwrap();
    map.set_fh(&Digest::new(1, 1), b"a").unwrap();
}

#[test]
fn test_temp_directory_created() {
    let env = TestEnvironment::new().unwrap();
    let mut config = env.config(1);
    config.temp_directory = env.temp_dir.join("nested").join("scratch");
    config.storage_directory = env.storage_dir.join("fresh");
    let _map = HandleMap::init(&config).unwrap();
    assert!(config.temp_directory.is_dir());
    assert_eq!(fhmap::count_shard_files(&config.storage_directory).unwrap(), 1);
}
