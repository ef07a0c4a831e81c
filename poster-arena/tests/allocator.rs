use poster_arena::{Arena, Region, HEADER_SIZE};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Malloc(u64),
    /// Free the live allocation at this index, modulo the number of live allocations.
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..2048).prop_map(Op::Malloc),
        any::<usize>().prop_map(Op::Free),
    ]
}

fn assert_disjoint(live: &[(u64, u64)]) {
    let mut sorted = live.to_vec();
    sorted.sort();
    for pair in sorted.windows(2) {
        let (a, a_len) = pair[0];
        let (b, _) = pair[1];
        assert!(a + a_len <= b, "allocation {a}+{a_len} overlaps {b}");
    }
}

proptest! {
    #[test]
    fn live_allocations_never_overlap(ops in proptest::collection::vec(op(), 1..200)) {
        let region = Region::anonymous(1 << 16).unwrap();
        let arena = Arena::format(&region).unwrap();
        let mut live: Vec<(u64, u64)> = vec![];

        for op in ops {
            match op {
                Op::Malloc(n) => {
                    // Exhaustion is fine, it must just not hand out overlapping memory.
                    if let Ok(off) = arena.malloc(n) {
                        prop_assert!(arena.usable(off).unwrap() >= n);
                        prop_assert!(off + n <= arena.capacity());
                        live.push((off, n));
                    }
                }
                Op::Free(idx) if !live.is_empty() => {
                    let (off, _) = live.swap_remove(idx % live.len());
                    prop_assert!(arena.free(off).is_ok());
                }
                Op::Free(_) => {}
            }

            assert_disjoint(&live);
        }

        // Free chunks are never adjacent.
        let chunks = arena.free_chunks().unwrap();
        for pair in chunks.windows(2) {
            prop_assert!(pair[0].offset + pair[0].len < pair[1].offset);
        }

        for (off, _) in live.drain(..) {
            prop_assert!(arena.free(off).is_ok());
        }

        let chunks = arena.free_chunks().unwrap();
        prop_assert_eq!(chunks.len(), 1);
        prop_assert_eq!(chunks[0].offset, HEADER_SIZE);
        prop_assert_eq!(chunks[0].len, arena.capacity() - HEADER_SIZE);
    }
}

#[test]
fn payloads_keep_their_content() {
    let region = Region::anonymous(1 << 14).unwrap();
    let arena = Arena::format(&region).unwrap();

    let offsets: Vec<u64> = (0..8u8)
        .map(|i| {
            let off = arena.malloc(100).unwrap();
            region.fill(off, 100, i);
            off
        })
        .collect();

    arena.free(offsets[3]).unwrap();
    arena.free(offsets[5]).unwrap();
    let reused = arena.malloc(40).unwrap();
    region.fill(reused, 40, 0xee);

    for (i, &off) in offsets.iter().enumerate() {
        if i == 3 || i == 5 {
            continue;
        }
        let mut buf = [0; 100];
        region.copy_out(off, &mut buf);
        assert!(buf.iter().all(|&b| b == i as u8), "allocation {i} was clobbered");
    }
}
