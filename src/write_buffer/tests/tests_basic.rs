#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::entry::{Entry, Resolve};
    use crate::write_buffer::WriteBuffer;

    // `⊕` appends the newer value after the older one.
    fn concat() -> Resolve {
        Arc::new(|new: &[u8], old: &[u8]| {
            let mut v = old.to_vec();
            v.extend_from_slice(new);
            v
        })
    }

    #[test]
    fn test_empty_buffer() {
        let wb = WriteBuffer::empty();
        assert_eq!(wb.num_entries(), 0);
        assert!(wb.is_empty());
        assert!(wb.to_list().is_empty());
        assert!(wb.get(b"k").is_none());
    }

    #[test]
    fn test_insert_and_get() {
        let resolve = concat();
        let mut wb = WriteBuffer::empty();
        wb.insert(b"b".to_vec(), Entry::Insert(b"2".to_vec()), &resolve);
        wb.insert(b"a".to_vec(), Entry::Insert(b"1".to_vec()), &resolve);

        assert_eq!(wb.num_entries(), 2);
        assert_eq!(wb.get(b"a"), Some(&Entry::Insert(b"1".to_vec())));
        assert_eq!(wb.get(b"b"), Some(&Entry::Insert(b"2".to_vec())));
        assert!(wb.get(b"c").is_none());
    }

    #[test]
    fn test_to_list_is_key_ordered() {
        let resolve = concat();
        let mut wb = WriteBuffer::empty();
        for key in [&b"zebra"[..], b"apple", b"mango", b"kiwi"] {
            wb.insert(key.to_vec(), Entry::Insert(b"v".to_vec()), &resolve);
        }

        let keys: Vec<Vec<u8>> = wb.to_list().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"apple".to_vec(), b"kiwi".to_vec(), b"mango".to_vec(), b"zebra".to_vec()]);
    }

    #[test]
    fn test_from_map_and_into_map_round_trip() {
        let mut map = BTreeMap::new();
        map.insert(b"x".to_vec(), Entry::Insert(b"1".to_vec()));
        map.insert(b"y".to_vec(), Entry::Delete);

        let wb = WriteBuffer::from_map(map.clone());
        assert_eq!(wb.num_entries(), 2);
        assert_eq!(wb.into_map(), map);
    }

    #[test]
    fn test_range_bounds() {
        let resolve = concat();
        let mut wb = WriteBuffer::empty();
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            wb.insert(key.to_vec(), Entry::Insert(key.to_vec()), &resolve);
        }

        let in_range: Vec<Vec<u8>> = wb.range(b"b", b"d").map(|(k, _)| k.clone()).collect();
        assert_eq!(in_range, vec![b"b".to_vec(), b"c".to_vec()]);

        // Inverted and empty ranges yield nothing.
        assert_eq!(wb.range(b"d", b"b").count(), 0);
        assert_eq!(wb.range(b"b", b"b").count(), 0);
    }

    #[test]
    fn test_union_prefers_newer_side() {
        let resolve = concat();
        let mut newer = WriteBuffer::empty();
        let mut older = WriteBuffer::empty();
        newer.insert(b"shared".to_vec(), Entry::Insert(b"new".to_vec()), &resolve);
        newer.insert(b"only-new".to_vec(), Entry::Insert(b"n".to_vec()), &resolve);
        older.insert(b"shared".to_vec(), Entry::Insert(b"old".to_vec()), &resolve);
        older.insert(b"only-old".to_vec(), Entry::Insert(b"o".to_vec()), &resolve);

        let merged = newer.union(older, &resolve);
        assert_eq!(merged.num_entries(), 3);
        assert_eq!(merged.get(b"shared"), Some(&Entry::Insert(b"new".to_vec())));
        assert_eq!(merged.get(b"only-new"), Some(&Entry::Insert(b"n".to_vec())));
        assert_eq!(merged.get(b"only-old"), Some(&Entry::Insert(b"o".to_vec())));
    }

    #[test]
    fn test_union_resolves_mupdates_across_sides() {
        let resolve = concat();
        let mut newer = WriteBuffer::empty();
        let mut older = WriteBuffer::empty();
        newer.insert(b"k".to_vec(), Entry::Mupdate(b"x".to_vec()), &resolve);
        older.insert(b"k".to_vec(), Entry::Insert(b"y".to_vec()), &resolve);

        let merged = newer.union(older, &resolve);
        assert_eq!(merged.get(b"k"), Some(&Entry::Insert(b"yx".to_vec())));
    }
}
