//! Concurrent attachment claims converge to the highest-priority word.

use proptest::prelude::*;
use std::thread;
use trackmerge_algorithms::{AttachmentArena, ErrorFlags};
use trackmerge_core::attach;

fn priority() -> impl Strategy<Value = u32> {
    prop_oneof![
        Just(attach::TUBE),
        Just(attach::FIT),
        Just(attach::FIT | attach::PRIMARY_LEG),
        Just(attach::GOOD_TRACK | attach::FIT),
        Just(attach::GOOD_TRACK | attach::FIT | attach::PRIMARY_LEG),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn claims_resolve_to_max_word(
        claims in prop::collection::vec((0usize..16, priority(), 0u32..1000), 1..200),
        threads in 1usize..6,
    ) {
        let arena = AttachmentArena::new(16);
        let errors = ErrorFlags::new();
        let chunk = claims.len().div_ceil(threads);
        thread::scope(|s| {
            for part in claims.chunks(chunk) {
                let arena = &arena;
                let errors = &errors;
                s.spawn(move || {
                    for &(cluster, flags, owner) in part {
                        arena.claim(cluster, attach::encode(flags, owner), errors);
                    }
                });
            }
        });

        let mut expected = vec![0u32; 16];
        for &(cluster, flags, owner) in &claims {
            expected[cluster] = expected[cluster].max(attach::encode(flags, owner));
        }
        prop_assert_eq!(arena.into_vec(), expected);
        prop_assert!(errors.report().is_empty());
    }

    #[test]
    fn out_of_range_claims_are_reported(index in 16usize..100) {
        let arena = AttachmentArena::new(16);
        let errors = ErrorFlags::new();
        prop_assert!(!arena.claim(index, attach::encode(attach::FIT, 1), &errors));
        let overflow = trackmerge_algorithms::ErrorCode::AttachmentOverflow;
        prop_assert_eq!(errors.report().codes(), vec![overflow]);
    }
}
