use super::*;
use crate::raw::CACHE_LINE_SIZE;

#[test]
fn new_is_lazy() {
    let map: CellMap<u64, u64> = CellMap::new();
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
    assert_eq!(map.capacity(), 0);
    assert_eq!(map.get(&1), None);
}

#[test]
fn insert_get_remove() {
    let mut map: CellMap<u64, u64> = CellMap::new();
    map.insert(1, 10);
    map.insert(2, 20);
    assert_eq!(map.capacity(), 64);
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&1), Some(&10));
    assert_eq!(map.get(&2), Some(&20));
    assert_eq!(map.get(&3), None);
    assert!(map.contains_key(&1));

    assert!(map.remove(&1));
    assert!(!map.remove(&1));
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&1), None);
    assert_eq!(map.get(&2), Some(&20));
}

#[test]
fn insert_returns_the_stored_value() {
    let mut map: CellMap<u32, u32> = CellMap::new();
    let value = map.insert(5, 50);
    assert_eq!(*value, 50);
    *value += 1;
    assert_eq!(map.get(&5), Some(&51));
}

#[test]
fn insert_twice_overwrites() {
    let mut map: CellMap<u64, i32> = CellMap::new();
    map.insert(9, -1);
    map.insert(9, -2);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&9), Some(&-2));
}

#[test]
fn get_mut_mutates_in_place() {
    let mut map: CellMap<u8, u64> = CellMap::new();
    map.insert(1, 100);
    *map.get_mut(&1).unwrap() += 1;
    assert_eq!(map.get(&1), Some(&101));
    assert_eq!(map.get_mut(&2), None);
}

#[test]
fn mismatched_key_and_value_sizes() {
    let mut map: CellMap<u8, u128> = CellMap::new();
    for key in 0..=255u8 {
        map.insert(key, u128::from(key) << 64);
    }
    assert_eq!(map.len(), 256);
    for key in 0..=255u8 {
        assert_eq!(map.get(&key), Some(&(u128::from(key) << 64)));
    }
}

#[test]
fn zero_sized_values() {
    let mut set: CellMap<u64, ()> = CellMap::new();
    set.insert(1, ());
    set.insert(2, ());
    set.insert(1, ());
    assert_eq!(set.len(), 2);
    assert_eq!(set.get(&1), Some(&()));
    assert!(set.remove(&2));
    assert_eq!(set.len(), 1);
}

#[test]
fn str_keys_hash_by_contents() {
    // Declared before the map so the borrow outlives it.
    let key = String::from("abc");
    let mut map: CellMap<&str, u32> = CellMap::new();
    map.insert("abc", 7);
    // A different reference with equal contents must find the entry.
    assert_eq!(map.get(&key.as_str()), Some(&7));
    assert_eq!(map.get(&"abd"), None);
}

#[test]
fn c_str_keys() {
    use core::ffi::CStr;
    let a = CStr::from_bytes_with_nul(b"alpha\0").unwrap();
    let b = CStr::from_bytes_with_nul(b"beta\0").unwrap();
    let mut map: CellMap<&CStr, u8> = CellMap::new();
    map.insert(a, 1);
    map.insert(b, 2);
    assert_eq!(map.get(&a), Some(&1));
    assert_eq!(map.get(&b), Some(&2));
    assert!(map.remove(&a));
    assert_eq!(map.get(&a), None);
}

#[test]
fn byte_array_keys_short_and_long() {
    let mut short: CellMap<[u8; 4], u32> = CellMap::new();
    short.insert([1, 2, 3, 4], 1);
    assert_eq!(short.get(&[1, 2, 3, 4]), Some(&1));
    assert_eq!(short.get(&[4, 3, 2, 1]), None);

    // Larger than the fixed-size hasher family; also larger than the
    // elements-per-cell sweet spot for small types.
    let mut long: CellMap<[u8; 24], u32> = CellMap::new();
    long.insert([7; 24], 2);
    assert_eq!(long.get(&[7; 24]), Some(&2));
}

#[test]
fn bool_and_char_keys() {
    let mut flags: CellMap<bool, u8> = CellMap::new();
    flags.insert(true, 1);
    flags.insert(false, 0);
    assert_eq!(flags.get(&true), Some(&1));

    let mut chars: CellMap<char, u32> = CellMap::new();
    chars.insert('µ', 0xb5);
    assert_eq!(chars.get(&'µ'), Some(&0xb5));
    assert_eq!(chars.get(&'m'), None);
}

#[test]
fn with_capacity_rounds_to_a_power_of_two() {
    let map: CellMap<u64, u64> = CellMap::with_capacity(10_000);
    assert_eq!(map.capacity(), 16_384);
    assert_eq!(map.len(), 0);

    let map: CellMap<u64, u64> = CellMap::with_capacity(0);
    assert_eq!(map.capacity(), 64);
}

#[test]
fn clear_retains_capacity() {
    let mut map: CellMap<u64, u64> = CellMap::new();
    for key in 0..100 {
        map.insert(key, key);
    }
    let capacity = map.capacity();
    map.clear();
    assert_eq!(map.len(), 0);
    assert_eq!(map.capacity(), capacity);
    assert_eq!(map.get(&1), None);

    map.insert(1, 2);
    assert_eq!(map.get(&1), Some(&2));
}

#[test]
fn try_insert_and_try_reserve_succeed() {
    let mut map: CellMap<u64, u64> = CellMap::new();
    assert_eq!(map.try_insert(1, 10).map(|v| *v), Ok(10));
    assert!(map.try_reserve(1024).is_ok());
    assert_eq!(map.capacity(), 1024);
    // Shrinking halves the table one step at a time.
    assert!(map.try_shrink().is_ok());
    assert_eq!(map.capacity(), 512);
    assert!(map.try_shrink().is_ok());
    assert_eq!(map.capacity(), 256);
}

#[test]
fn shrink_keeps_entries() {
    let mut map: CellMap<u64, u64> = CellMap::with_capacity(512);
    for key in 0..20 {
        map.insert(key, key * 2);
    }
    map.shrink();
    assert_eq!(map.capacity(), 256);
    for key in 0..20 {
        assert_eq!(map.get(&key), Some(&(key * 2)));
    }
}

#[test]
fn descriptor_matches_the_types() {
    let map: CellMap<u16, u64> = CellMap::new();
    let info = map.descriptor();
    assert_eq!(info.key().size_of_type(), 2);
    assert_eq!(info.key().elements_per_cell(), CACHE_LINE_SIZE / 2);
    assert_eq!(info.value().size_of_type(), 8);
    assert_eq!(info.value().elements_per_cell(), CACHE_LINE_SIZE / 8);
}

#[test]
fn default_and_debug() {
    let map: CellMap<u64, u64> = CellMap::default();
    assert_eq!(map.len(), 0);
    let text = format!("{:?}", map);
    assert!(text.contains("CellMap"));
    assert!(text.contains("len"));
}

#[test]
fn from_raw_and_into_raw_round_trip() {
    let mut map: CellMap<u64, u64> = CellMap::new();
    map.insert(3, 30);

    let raw = map.into_raw();
    assert_eq!(raw.len(), 1);

    // SAFETY: the raw map came from a `CellMap<u64, u64>`.
    let map: CellMap<u64, u64> = unsafe { CellMap::from_raw(raw) };
    assert_eq!(map.get(&3), Some(&30));
}
