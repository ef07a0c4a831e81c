#![cfg(target_family = "unix")]
use poster_arena::{Arena, Region};

#[test]
fn two_mappings_share_one_arena() {
    let file = tempfile::tempfile().expect("to create a backing file");
    file.set_len(1 << 16).unwrap();

    let first = Region::from_fd(&file).unwrap();
    let second = Region::from_fd(&file).unwrap();
    assert!(first.is_shared());

    let arena = Arena::format(&first).unwrap();
    let off = arena.malloc(13).unwrap();
    first.copy_in(off, b"Hello, world!");
    arena.set_root(off);

    // The second mapping sits at another address, offsets still resolve to the same bytes.
    let attached = Arena::attach(&second).unwrap();
    assert_eq!(attached.root(), Some(off));
    let mut buf = [0; 13];
    second.copy_out(off, &mut buf);
    assert_eq!(&buf, b"Hello, world!");

    attached.free(off).unwrap();
    assert_eq!(arena.free_chunks().unwrap().len(), 1);
}

#[test]
fn unformatted_file_is_rejected() {
    let file = tempfile::tempfile().unwrap();
    file.set_len(4096).unwrap();
    let region = Region::from_fd(&file).unwrap();
    assert!(!Arena::is_formatted(&region));
    assert!(Arena::attach(&region).is_err());
}
