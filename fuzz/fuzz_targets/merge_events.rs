#![no_main]

use std::collections::BTreeSet;

use libfuzzer_sys::fuzz_target;
use opsdeck_core::model::item::Item;
use opsdeck_core::query::QueryEntry;
use opsdeck_core::stream::{EventWindow, TotalPolicy, merge_item};

// Input: JSON array of pushed payloads. Undecodable payloads are dropped
// the way the stream engine drops them; the rest must leave the list free
// of duplicates with `total` counting every distinct id.
fuzz_target!(|data: &[u8]| {
    let Ok(serde_json::Value::Array(payloads)) = serde_json::from_slice(data) else {
        return;
    };

    let mut entry = QueryEntry::success(Vec::new(), Some(0), chrono::DateTime::default());
    let mut window = EventWindow::new(16);
    let mut distinct = BTreeSet::new();

    for (n, payload) in payloads.into_iter().enumerate() {
        if !window.admit(&format!("evt-{}", n % 24)) {
            continue;
        }
        let Ok(item) = Item::from_value(payload) else {
            continue;
        };
        distinct.insert(item.id.clone());
        merge_item(&mut entry, item, TotalPolicy::CountInserts);
    }

    let ids: BTreeSet<_> = entry.items().iter().map(|item| item.id.clone()).collect();
    assert_eq!(ids.len(), entry.items().len(), "duplicate id after merge");
    assert_eq!(ids, distinct);
    assert_eq!(entry.total, Some(distinct.len() as u64));
    assert!(window.len() <= 16);
});
