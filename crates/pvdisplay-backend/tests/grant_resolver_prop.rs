use proptest::prelude::*;
use pvdisplay_backend::{resolve_grant_refs, DisplayError, GrantTable};
use pvdisplay_protocol::directory::{
    directory_pages_for_grefs, grefs_for_size, GREFS_PER_DIRECTORY_PAGE,
};
use pvdisplay_protocol::{GrantRef, PAGE_SIZE};

const DIRECTORY_BASE: GrantRef = 1;
const DATA_BASE: GrantRef = 100_000;

fn size_strategy() -> impl Strategy<Value = usize> {
    prop_oneof![
        Just(0usize),
        1usize..=PAGE_SIZE,
        // Around the single-directory-page boundary (1023 refs).
        (1020usize..=1026).prop_map(|pages| pages * PAGE_SIZE),
        1usize..=3000 * PAGE_SIZE,
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn resolves_exactly_the_needed_refs_or_fails_closed(
        size in size_strategy(),
        directory_shortfall in 0usize..=1,
    ) {
        let needed = grefs_for_size(size);
        let data: Vec<GrantRef> = (DATA_BASE..DATA_BASE + needed as GrantRef).collect();
        let directory_pages = directory_pages_for_grefs(needed)
            .saturating_sub(directory_shortfall)
            .max(1);
        let directory: Vec<GrantRef> =
            (DIRECTORY_BASE..DIRECTORY_BASE + directory_pages as GrantRef).collect();

        let table = GrantTable::new();
        table.share_directory_chain(&directory, &data);

        let chain_capacity = directory_pages * GREFS_PER_DIRECTORY_PAGE;
        match resolve_grant_refs(&table, DIRECTORY_BASE, size) {
            Ok(desc) => {
                prop_assert!(chain_capacity >= needed);
                prop_assert_eq!(desc.grefs(), data.as_slice());
                prop_assert_eq!(desc.size(), size);
            }
            Err(DisplayError::InvalidDescriptor(_)) => {
                prop_assert!(chain_capacity < needed);
            }
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }
}
