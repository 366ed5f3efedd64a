use crate::bucket::siblings::{CausalContext, ConflictResolution, Dot, DottedVersion, Sibling, SiblingSet};

fn clock(site: &str, counter: u64, context: &[(&str, u64)]) -> DottedVersion {
    DottedVersion {
        dot: Dot { site_id: site.into(), counter },
        context: context.iter().map(|(s, c)| (s.to_string(), *c)).collect(),
    }
}

fn value_sibling(site: &str, counter: u64, context: &[(&str, u64)], value: &str, ts: u64) -> Sibling {
    Sibling::new(clock(site, counter, context), value.as_bytes().to_vec(), ts)
}

#[test]
fn dominated_by_covers_the_dot() {
    let a = clock("a", 1, &[]);
    let b = clock("b", 1, &[("a", 1)]);

    assert!(a.dominated_by(&b), "b observed a's write, so a is dominated");
    assert!(!b.dominated_by(&a));
}

#[test]
fn concurrent_clocks_do_not_dominate_each_other() {
    let a = clock("a", 2, &[("b", 1)]);
    let b = clock("b", 2, &[("a", 1)]);

    assert!(!a.dominated_by(&b));
    assert!(!b.dominated_by(&a));
}

#[test]
fn same_site_higher_counter_dominates() {
    let old = clock("a", 1, &[]);
    let new = clock("a", 2, &[]);

    assert!(old.dominated_by(&new));
    assert!(!new.dominated_by(&old));
}

#[test]
fn a_clock_does_not_dominate_itself() {
    let a = clock("a", 1, &[]);
    assert!(!a.dominated_by(&a.clone()));
}

#[test]
fn event_produces_a_clock_above_all_known_state() {
    let set = SiblingSet::from_siblings(vec![
        value_sibling("a", 3, &[], "v1", 1),
        value_sibling("b", 5, &[("a", 2)], "v2", 2),
    ]);

    let next = set.event(CausalContext::new(), "a");

    assert_eq!(next.dot.site_id, "a");
    assert_eq!(next.dot.counter, 4, "new counter must exceed every recorded event for the site");
    let dominated = set.iter().filter(|s| s.clock.dominated_by(&next)).count();
    assert_eq!(dominated, 1, "only the site's own prior write is covered by an empty-context event");
}

#[test]
fn join_covers_every_sibling() {
    let set = SiblingSet::from_siblings(vec![
        value_sibling("a", 3, &[("c", 7)], "v1", 1),
        value_sibling("b", 5, &[("a", 2)], "v2", 2),
    ]);

    let joined = set.join();

    assert_eq!(joined.get("a"), Some(&3));
    assert_eq!(joined.get("b"), Some(&5));
    assert_eq!(joined.get("c"), Some(&7));
}

#[test]
fn discard_drops_dominated_siblings_only() {
    let set = SiblingSet::from_siblings(vec![
        value_sibling("a", 1, &[], "old", 1),
        value_sibling("b", 9, &[], "concurrent", 2),
    ]);

    let discarded = set.discard(&clock("c", 1, &[("a", 5)]));

    assert_eq!(discarded.len(), 1);
    assert!(discarded.iter().all(|s| s.clock.dot.site_id == "b"));
}

#[test]
fn sync_keeps_concurrent_siblings() {
    let a = SiblingSet::from_siblings(vec![value_sibling("a", 1, &[], "va", 1)]);
    let b = SiblingSet::from_siblings(vec![value_sibling("b", 1, &[], "vb", 2)]);

    let merged = a.sync(&b);

    assert_eq!(merged.len(), 2, "concurrent siblings must both survive a merge");
}

#[test]
fn sync_discards_superseded_siblings() {
    let old = SiblingSet::from_siblings(vec![value_sibling("a", 1, &[], "old", 1)]);
    let new = SiblingSet::from_siblings(vec![value_sibling("a", 2, &[("a", 1)], "new", 2)]);

    let merged = old.sync(&new);

    assert_eq!(merged.len(), 1);
    assert!(merged.iter().all(|s| s.value.as_deref() == Some(b"new".as_ref())));
}

#[test]
fn sync_is_commutative_associative_idempotent() {
    let a = SiblingSet::from_siblings(vec![value_sibling("a", 1, &[], "va", 1)]);
    let b = SiblingSet::from_siblings(vec![value_sibling("b", 1, &[("a", 1)], "vb", 2)]);
    let c = SiblingSet::from_siblings(vec![value_sibling("c", 4, &[], "vc", 3)]);

    assert_eq!(a.sync(&b), b.sync(&a), "sync must be commutative");
    assert_eq!(a.sync(&b).sync(&c), a.sync(&b.sync(&c)), "sync must be associative");
    assert_eq!(a.sync(&a), a, "sync must be idempotent");

    let merged = a.sync(&b).sync(&c);
    assert_eq!(merged.sync(&merged), merged);
}

#[test]
fn tombstone_sets_are_detected() {
    let live = SiblingSet::from_siblings(vec![value_sibling("a", 1, &[], "v", 1)]);
    assert!(!live.is_tombstone_set());

    let dead = SiblingSet::from_siblings(vec![
        Sibling::tombstone(clock("a", 2, &[("a", 1)]), 50),
        Sibling::tombstone(clock("b", 1, &[]), 10),
    ]);
    assert!(dead.is_tombstone_set());
    assert_eq!(dead.oldest_tombstone().map(|s| s.timestamp), Some(10));
}

#[test]
fn empty_set_is_not_a_tombstone_set() {
    assert!(!SiblingSet::default().is_tombstone_set());
}

#[test]
fn last_writer_wins_keeps_only_the_newest_sibling() {
    let set = SiblingSet::from_siblings(vec![
        value_sibling("a", 1, &[], "older", 10),
        value_sibling("b", 1, &[], "newer", 20),
    ]);

    let resolved = ConflictResolution::LastWriterWins.resolve(set.clone());

    assert_eq!(resolved.len(), 1);
    assert!(resolved.iter().all(|s| s.value.as_deref() == Some(b"newer".as_ref())));

    let merged = ConflictResolution::MergeSiblings.resolve(set.clone());
    assert_eq!(merged, set);
}
