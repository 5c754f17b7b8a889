use indexmap::map::Iter;
use indexmap::IndexMap;

/// Byte offsets of the `<spectrum>` elements of an mzML file keyed by native
/// ID. The position of an entry is the position of its scan in file order, so
/// the same map answers both ID and position lookups.
#[derive(Default, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OffsetIndex {
    pub name: String,

    #[cfg_attr(feature = "serde", serde(with = "indexmap::map::serde_seq"))]
    pub offsets: IndexMap<Box<str>, u64>,

    /// Set once the index has been read or built, an empty run included
    pub init: bool,
}

impl OffsetIndex {
    pub fn new(name: String) -> OffsetIndex {
        OffsetIndex {
            name,
            ..Default::default()
        }
    }

    #[inline]
    pub fn get(&self, native_id: &str) -> Option<u64> {
        self.offsets.get(native_id).copied()
    }

    /// The native ID and offset of the scan at `position`
    #[inline]
    pub fn get_index(&self, position: usize) -> Option<(&str, u64)> {
        self.offsets
            .get_index(position)
            .map(|(native_id, offset)| (native_id.as_ref(), *offset))
    }

    #[inline]
    pub fn index_of(&self, native_id: &str) -> Option<usize> {
        self.offsets.get_index_of(native_id)
    }

    /// Record the offset of `native_id`. A repeated ID keeps its first position
    /// and the previous offset is returned.
    #[inline]
    pub fn insert<T: Into<Box<str>>>(&mut self, native_id: T, offset: u64) -> Option<u64> {
        self.offsets.insert(native_id.into(), offset)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.init = false;
    }

    pub fn iter(&self) -> Iter<'_, Box<str>, u64> {
        self.offsets.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_positions_follow_insertion() {
        let mut index = OffsetIndex::new("spectrum".into());
        index.insert("scan=3", 900);
        index.insert("scan=1", 120);
        assert_eq!(index.index_of("scan=1"), Some(1));
        assert_eq!(index.get_index(0), Some(("scan=3", 900)));
        assert_eq!(index.insert("scan=3", 950), Some(900));
        assert_eq!(index.index_of("scan=3"), Some(0));
        assert_eq!(index.get("scan=3"), Some(950));
        assert!(index.get("scan=2").is_none());
        assert!(index.get_index(2).is_none());

        index.init = true;
        index.clear();
        assert!(index.is_empty());
        assert!(!index.init);
    }
}
