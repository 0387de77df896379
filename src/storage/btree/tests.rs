use super::leaf::{
    self, dump_entries_since_time, is_mergable, is_underfull, level, merge, split, validate,
    EventLog, Leaf, ReplicationEvent, DELETION_RESERVE_FRACTION, MANDATORY_TIMESTAMPS,
};
use super::{FixedSizer, ValueSizer, VarSizer, MAX_KEY_SIZE};
use crate::types::{BlockSize, Result, Timestamp};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("leafnode=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn empty_leaf<S: ValueSizer>(sizer: &S) -> Result<Leaf<Vec<u8>>> {
    Leaf::init(sizer, vec![0u8; sizer.block_size().value()])
}

fn contents<S: ValueSizer>(sizer: &S, node: &Leaf<Vec<u8>>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    node.iter(sizer)
        .map(|pair| pair.map(|p| (p.key.to_vec(), p.value.to_vec())))
        .collect()
}

fn fixed_value(key: &[u8]) -> [u8; 16] {
    let mut value = [0u8; 16];
    value[..key.len()].copy_from_slice(key);
    value
}

/// Inserts random entries until `stop` says so or the next insert would not fit.
fn fill_random<F>(
    sizer: &VarSizer,
    node: &mut Leaf<Vec<u8>>,
    rng: &mut ChaCha8Rng,
    model: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    clock: &mut u64,
    stop: F,
) -> Result<()>
where
    F: Fn(&Leaf<Vec<u8>>) -> bool,
{
    loop {
        let key_len = rng.gen_range(4..=24);
        let key: Vec<u8> = (0..key_len).map(|_| rng.gen()).collect();
        let payload_len = rng.gen_range(0..=64);
        let payload: Vec<u8> = (0..payload_len).map(|_| rng.gen()).collect();
        let value = sizer.encoded(&payload)?;
        if stop(node) || node.is_full(sizer, &key, Some(&value))? {
            return Ok(());
        }
        *clock += 1;
        node.insert(sizer, &key, &value, Timestamp(*clock))?;
        model.insert(key, value);
    }
}

#[test]
fn insert_two_keys_and_lookup() -> Result<()> {
    let sizer = FixedSizer::new(2, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    node.insert(&sizer, b"a", b"v1", Timestamp(1))?;
    node.insert(&sizer, b"b", b"v2", Timestamp(2))?;
    assert_eq!(node.lookup(&sizer, b"a")?, Some(&b"v1"[..]));
    assert_eq!(node.lookup(&sizer, b"b")?, Some(&b"v2"[..]));
    assert_eq!(node.find_key(b"c")?, None);
    validate(&sizer, &node)?;
    Ok(())
}

#[test]
fn erase_presence_of_absent_key_changes_nothing() -> Result<()> {
    let sizer = FixedSizer::new(2, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    node.insert(&sizer, b"a", b"v1", Timestamp(1))?;
    let before = node.as_bytes().to_vec();
    assert!(!node.erase_presence(&sizer, b"zz")?);
    assert_eq!(node.as_bytes(), before.as_slice());
    Ok(())
}

#[test]
fn fill_until_full_then_split() -> Result<()> {
    init_tracing();
    let sizer = VarSizer::new(200, BlockSize::DEFAULT);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_0001);
    let mut model = BTreeMap::new();
    let mut clock = 0;
    let mut node = empty_leaf(&sizer)?;
    fill_random(&sizer, &mut node, &mut rng, &mut model, &mut clock, |_| false)?;
    assert!(node.num_pairs() > 2);

    let mut sibling = empty_leaf(&sizer)?;
    let median = split(&sizer, &mut node, &mut sibling)?;
    validate(&sizer, &node)?;
    validate(&sizer, &sibling)?;
    assert!(!node.is_empty() && !sibling.is_empty());
    assert_eq!(sibling.key_at(0)?, median.as_slice());
    assert!(node.key_at(node.num_pairs() - 1)? < median.as_slice());

    let mut combined = contents(&sizer, &node)?;
    combined.extend(contents(&sizer, &sibling)?);
    let expected: Vec<_> = model.into_iter().collect();
    assert_eq!(combined, expected);

    let max_key = [0xffu8; MAX_KEY_SIZE];
    let max_value = sizer.encoded(&[0u8; 200])?;
    assert!(!node.is_full(&sizer, &max_key, Some(&max_value))?);
    assert!(!sibling.is_full(&sizer, &max_key, Some(&max_value))?);
    Ok(())
}

#[test]
fn split_of_two_entries() -> Result<()> {
    let sizer = FixedSizer::new(2, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    node.insert(&sizer, b"a", b"v1", Timestamp(1))?;
    node.insert(&sizer, b"b", b"v2", Timestamp(2))?;
    let mut sibling = empty_leaf(&sizer)?;
    let median = split(&sizer, &mut node, &mut sibling)?;
    assert_eq!(median.as_slice(), b"b");
    assert_eq!(node.num_pairs(), 1);
    assert_eq!(sibling.lookup(&sizer, b"b")?, Some(&b"v2"[..]));
    Ok(())
}

#[test]
fn remove_then_dump_reports_deletion_once() -> Result<()> {
    let sizer = FixedSizer::new(2, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    node.insert(&sizer, b"a", b"v1", Timestamp(1))?;
    node.insert(&sizer, b"b", b"v2", Timestamp(2))?;
    assert!(!node.is_full(&sizer, b"a", None)?);
    node.remove(&sizer, b"a", Timestamp(3))?;

    let mut log = EventLog::default();
    dump_entries_since_time(&sizer, &node, Timestamp(2), Timestamp(100), &mut log)?;
    assert_eq!(
        log.events,
        vec![ReplicationEvent::Deletion {
            key: b"a".to_vec(),
            timestamp: Timestamp(3),
        }]
    );
    assert_eq!(log.batches, 1);
    Ok(())
}

#[test]
fn remove_of_absent_key_records_one_deletion() -> Result<()> {
    let sizer = FixedSizer::new(2, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    node.remove(&sizer, b"ghost", Timestamp(1))?;
    node.remove(&sizer, b"ghost", Timestamp(2))?;
    assert!(node.is_empty());
    assert_eq!(node.header().history_count, 1);
    let records = node.history().collect::<Result<Vec<_>>>()?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].deleted_key, Some(&b"ghost"[..]));
    assert_eq!(records[0].timestamp, Timestamp(2));
    validate(&sizer, &node)?;

    let mut log = EventLog::default();
    dump_entries_since_time(&sizer, &node, Timestamp::DISTANT_PAST, Timestamp(100), &mut log)?;
    assert_eq!(
        log.events,
        vec![ReplicationEvent::Deletion {
            key: b"ghost".to_vec(),
            timestamp: Timestamp(2),
        }]
    );
    Ok(())
}

#[test]
fn insert_of_truncated_value_is_rejected() -> Result<()> {
    let sizer = VarSizer::new(200, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    let before = node.as_bytes().to_vec();
    assert!(node.is_full(&sizer, b"k", Some(&[5u8])).is_err());
    assert!(node.insert(&sizer, b"k", &[5u8], Timestamp(1)).is_err());
    assert_eq!(node.as_bytes(), before.as_slice());
    Ok(())
}

/// Inserts and removes one 100-byte key per cycle; returns the leaf.
fn churn_large_keys(sizer: &FixedSizer, cycles: u64) -> Result<Leaf<Vec<u8>>> {
    let mut node = empty_leaf(sizer)?;
    for cycle in 1..=cycles {
        let key = [cycle as u8; 100];
        node.insert(sizer, &key, &[0u8; 8], Timestamp(2 * cycle - 1))?;
        assert!(!node.is_full(sizer, &key, None)?);
        node.remove(sizer, &key, Timestamp(2 * cycle))?;
    }
    Ok(node)
}

#[test]
fn evicted_deletions_trigger_lost_deletions() -> Result<()> {
    init_tracing();
    let sizer = FixedSizer::new(8, BlockSize::new(1024)?);
    let removals = (DELETION_RESERVE_FRACTION + 5) as u64;
    let node = churn_large_keys(&sizer, removals)?;
    validate(&sizer, &node)?;
    assert!(node.header().history_count as usize >= MANDATORY_TIMESTAMPS);
    // The window holds the last three removals; the twelfth was the first evicted.
    assert_eq!(node.history_cutoff(), Timestamp(24));

    let mut log = EventLog::default();
    dump_entries_since_time(&sizer, &node, Timestamp(0), Timestamp(1000), &mut log)?;
    assert!(log.lost_deletions());
    assert_eq!(log.events[0], ReplicationEvent::LostDeletions);

    let mut recent = EventLog::default();
    dump_entries_since_time(&sizer, &node, Timestamp(25), Timestamp(1000), &mut recent)?;
    assert!(!recent.lost_deletions());
    assert_eq!(
        recent.deleted_keys(),
        vec![&[15u8; 100][..], &[14u8; 100][..], &[13u8; 100][..]]
    );
    Ok(())
}

#[test]
fn history_floor_keeps_every_recent_removal() -> Result<()> {
    let sizer = FixedSizer::new(8, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    for (i, key) in [b"x", b"y", b"z"].iter().enumerate() {
        node.remove(&sizer, *key, Timestamp(i as u64 + 1))?;
    }
    assert_eq!(node.header().history_count, 3);
    let mut log = EventLog::default();
    dump_entries_since_time(&sizer, &node, Timestamp(0), Timestamp(10), &mut log)?;
    assert!(!log.lost_deletions());
    assert_eq!(log.deleted_keys().len(), 3);
    Ok(())
}

#[test]
fn merge_reverses_split() -> Result<()> {
    let sizer = VarSizer::new(200, BlockSize::DEFAULT);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_0002);
    let mut model = BTreeMap::new();
    let mut clock = 0;
    let mut node = empty_leaf(&sizer)?;
    let limit = (BlockSize::DEFAULT.value() * 2) / 5;
    fill_random(&sizer, &mut node, &mut rng, &mut model, &mut clock, |leaf| {
        leaf.header().live_bytes() > limit
    })?;
    let mut sibling = empty_leaf(&sizer)?;
    split(&sizer, &mut node, &mut sibling)?;
    assert!(is_mergable(&sizer, &node, &sibling)?);
    merge(&sizer, &mut node, &mut sibling)?;
    assert!(node.is_empty());
    validate(&sizer, &sibling)?;
    let expected: Vec<_> = model.into_iter().collect();
    assert_eq!(contents(&sizer, &sibling)?, expected);
    assert_eq!(sibling.newest_timestamp(), Timestamp(clock));
    Ok(())
}

#[test]
fn split_routes_deletions_with_their_keys() -> Result<()> {
    let sizer = FixedSizer::new(8, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    let mut clock = 0;
    for i in 0..40u32 {
        clock += 1;
        node.insert(&sizer, format!("k{i:02}").as_bytes(), &[i as u8; 8], Timestamp(clock))?;
    }
    let removed = ["k05", "k10", "k30", "k35"];
    for key in removed {
        clock += 1;
        node.remove(&sizer, key.as_bytes(), Timestamp(clock))?;
    }
    let mut sibling = empty_leaf(&sizer)?;
    let median = split(&sizer, &mut node, &mut sibling)?;

    let mut low = EventLog::default();
    dump_entries_since_time(&sizer, &node, Timestamp(40), Timestamp(clock), &mut low)?;
    let mut high = EventLog::default();
    dump_entries_since_time(&sizer, &sibling, Timestamp(40), Timestamp(clock), &mut high)?;
    assert!(low.deleted_keys().iter().all(|key| *key < median.as_slice()));
    assert!(high.deleted_keys().iter().all(|key| *key >= median.as_slice()));
    let mut all: Vec<&[u8]> = low.deleted_keys();
    all.extend(high.deleted_keys());
    all.sort();
    let expected: Vec<&[u8]> = removed.iter().map(|key| key.as_bytes()).collect();
    assert_eq!(all, expected);
    Ok(())
}

#[test]
fn split_keeps_history_cutoff() -> Result<()> {
    let sizer = FixedSizer::new(8, BlockSize::new(1024)?);
    let mut node = churn_large_keys(&sizer, 15)?;
    for i in 0..4u64 {
        node.insert(&sizer, &[b'k', i as u8], &[0u8; 8], Timestamp(100 + i))?;
    }
    let cutoff = node.history_cutoff();
    assert!(cutoff > Timestamp::DISTANT_PAST);
    let mut sibling = empty_leaf(&sizer)?;
    split(&sizer, &mut node, &mut sibling)?;
    assert_eq!(node.history_cutoff(), cutoff);
    assert_eq!(sibling.history_cutoff(), cutoff);
    for side in [&node, &sibling] {
        let mut log = EventLog::default();
        dump_entries_since_time(&sizer, side, Timestamp(0), Timestamp(1000), &mut log)?;
        assert!(log.lost_deletions());
    }
    Ok(())
}

fn leaf_with_keys(sizer: &FixedSizer, keys: &[String], clock: &mut u64) -> Result<Leaf<Vec<u8>>> {
    let mut node = empty_leaf(sizer)?;
    for key in keys {
        *clock += 1;
        node.insert(sizer, key.as_bytes(), &fixed_value(key.as_bytes()), Timestamp(*clock))?;
    }
    Ok(node)
}

#[test]
fn level_pulls_smallest_keys_from_right_sibling() -> Result<()> {
    let sizer = FixedSizer::new(16, BlockSize::DEFAULT);
    let mut clock = 0;
    let small: Vec<String> = (0..3).map(|i| format!("a{i}")).collect();
    let large: Vec<String> = (0..80).map(|i| format!("m{i:03}")).collect();
    let mut node = leaf_with_keys(&sizer, &small, &mut clock)?;
    let mut sibling = leaf_with_keys(&sizer, &large, &mut clock)?;
    assert!(is_underfull(&sizer, &node));

    let leveled = level(&sizer, Ordering::Less, &mut node, &mut sibling)?.expect("level");
    assert_eq!(leveled.replacement_key.as_slice(), sibling.key_at(0)?);
    let moved_values = leveled.moved_values(&sizer, &node)?;
    let moved = moved_values.len();
    assert!(moved > 0);
    assert_eq!(leveled.moved, small.len()..small.len() + moved);
    assert_eq!(node.key_at(small.len())?, large[0].as_bytes());
    for (value, key) in moved_values.iter().zip(&large) {
        assert_eq!(*value, &fixed_value(key.as_bytes())[..]);
    }
    assert!(!is_underfull(&sizer, &sibling));
    assert_eq!(node.num_pairs(), small.len() + moved);
    assert_eq!(sibling.num_pairs(), large.len() - moved);
    validate(&sizer, &node)?;
    validate(&sizer, &sibling)?;
    Ok(())
}

#[test]
fn level_pulls_largest_keys_from_left_sibling() -> Result<()> {
    let sizer = FixedSizer::new(16, BlockSize::DEFAULT);
    let mut clock = 0;
    let large: Vec<String> = (0..80).map(|i| format!("m{i:03}")).collect();
    let small: Vec<String> = (0..3).map(|i| format!("z{i}")).collect();
    let mut sibling = leaf_with_keys(&sizer, &large, &mut clock)?;
    let mut node = leaf_with_keys(&sizer, &small, &mut clock)?;

    let leveled = level(&sizer, Ordering::Greater, &mut node, &mut sibling)?.expect("level");
    let moved_values = leveled.moved_values(&sizer, &node)?;
    let moved = moved_values.len();
    assert_eq!(leveled.moved, 0..moved);
    let first_moved = &large[large.len() - moved];
    assert_eq!(leveled.replacement_key.as_slice(), first_moved.as_bytes());
    for (value, key) in moved_values.iter().zip(&large[large.len() - moved..]) {
        assert_eq!(*value, &fixed_value(key.as_bytes())[..]);
    }
    assert_eq!(node.key_at(0)?, first_moved.as_bytes());
    assert!(sibling.key_at(sibling.num_pairs() - 1)? < first_moved.as_bytes());
    validate(&sizer, &node)?;
    validate(&sizer, &sibling)?;
    Ok(())
}

#[test]
fn level_declines_when_sibling_would_underflow() -> Result<()> {
    let sizer = FixedSizer::new(16, BlockSize::DEFAULT);
    let mut clock = 0;
    let small: Vec<String> = (0..3).map(|i| format!("a{i}")).collect();
    let modest: Vec<String> = (0..10).map(|i| format!("m{i:03}")).collect();
    let mut node = leaf_with_keys(&sizer, &small, &mut clock)?;
    let mut sibling = leaf_with_keys(&sizer, &modest, &mut clock)?;
    let node_before = node.as_bytes().to_vec();
    let sibling_before = sibling.as_bytes().to_vec();
    assert!(level(&sizer, Ordering::Less, &mut node, &mut sibling)?.is_none());
    assert_eq!(node.as_bytes(), node_before.as_slice());
    assert_eq!(sibling.as_bytes(), sibling_before.as_slice());
    assert!(is_mergable(&sizer, &node, &sibling)?);
    Ok(())
}

#[test]
fn randomized_ops_match_model_and_backfill() -> Result<()> {
    init_tracing();
    let sizer = VarSizer::new(64, BlockSize::new(2048)?);
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_0003);
    let mut node = empty_leaf(&sizer)?;
    let mut live: BTreeMap<Vec<u8>, (Vec<u8>, u64)> = BTreeMap::new();
    let mut removed: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
    let mut clock = 0u64;

    for step in 0..3000 {
        let key = (rng.gen_range(0..160u16)).to_be_bytes().to_vec();
        match rng.gen_range(0..10) {
            0..=5 => {
                let payload: Vec<u8> = (0..rng.gen_range(0..48)).map(|_| rng.gen()).collect();
                let value = sizer.encoded(&payload)?;
                if node.is_full(&sizer, &key, Some(&value))? {
                    continue;
                }
                clock += 1;
                node.insert(&sizer, &key, &value, Timestamp(clock))?;
                removed.remove(&key);
                live.insert(key, (value, clock));
            }
            6..=8 => {
                if node.is_full(&sizer, &key, None)? {
                    continue;
                }
                clock += 1;
                node.remove(&sizer, &key, Timestamp(clock))?;
                live.remove(&key);
                removed.insert(key, clock);
            }
            _ => {
                let present = node.erase_presence(&sizer, &key)?;
                assert_eq!(present, live.remove(&key).is_some());
            }
        }

        if step % 100 == 99 {
            validate(&sizer, &node)?;
            for (key, (value, _)) in &live {
                assert_eq!(node.lookup(&sizer, key)?, Some(value.as_slice()));
            }
            assert_eq!(node.num_pairs(), live.len());

            let minimum = clock.saturating_sub(40);
            let mut log = EventLog::default();
            dump_entries_since_time(&sizer, &node, Timestamp(minimum), Timestamp(clock), &mut log)?;
            let expected: Vec<&[u8]> = live
                .iter()
                .filter(|(_, (_, ts))| *ts > minimum)
                .map(|(key, _)| key.as_slice())
                .collect();
            assert_eq!(log.entry_keys(), expected);
            for key in log.deleted_keys() {
                assert!(!live.contains_key(key));
            }
            if !log.lost_deletions() {
                let reported = log.deleted_keys();
                for (key, ts) in &removed {
                    if *ts > minimum {
                        assert!(reported.contains(&key.as_slice()), "deletion lost silently");
                    }
                }
            }
        }
    }
    Ok(())
}

#[test]
fn usage_accounts_for_every_byte() -> Result<()> {
    let sizer = FixedSizer::new(8, BlockSize::DEFAULT);
    let mut node = empty_leaf(&sizer)?;
    node.insert(&sizer, b"k1", &[1u8; 8], Timestamp(1))?;
    node.remove(&sizer, b"k2", Timestamp(2))?;
    let usage = node.usage()?;
    usage.emit_tracing();
    assert_eq!(usage.num_pairs, 1);
    assert_eq!(usage.deletion_records, 1);
    assert_eq!(usage.history_records, 2);
    assert_eq!(
        leaf::HEADER_LEN + usage.live_bytes() + usage.history_bytes + usage.free_bytes,
        usage.block_size
    );
    Ok(())
}
