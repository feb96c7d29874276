use proptest::prelude::*;

/// Strategy for one supported date specifier
pub fn specifier_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["%Y", "%y", "%m", "%d", "%H", "%M", "%S", "%j"])
}

/// Strategy for literal separators that need no escaping in a file name
pub fn separator_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["", "_", "-", ".", "+", "run", "T"])
}

/// Strategy for date formats that the run directory pattern accepts
pub fn date_format_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec((separator_strategy(), specifier_strategy()), 1..7).prop_map(|parts| {
        parts
            .into_iter()
            .map(|(sep, spec)| format!("{sep}{spec}"))
            .collect()
    })
}

/// Strategy for acyclic dependency lists: step `i` may only depend on steps before it
pub fn dag_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..12).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                if i == 0 {
                    Just(Vec::new()).boxed()
                } else {
                    prop::collection::btree_set(0..i, 0..=i.min(3))
                        .prop_map(|deps| deps.into_iter().collect::<Vec<_>>())
                        .boxed()
                }
            })
            .collect::<Vec<_>>()
    })
}

/// Strategy for epoch seconds within 1970..2100
pub fn epoch_seconds_strategy() -> impl Strategy<Value = i64> {
    0i64..4_102_444_800
}
