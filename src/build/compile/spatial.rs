//! Packed spatial indexes: features in Hilbert order, grouped into
//! branches of `branch_size`, each branch carrying its bounding box and a
//! bitset of the indexed-key categories found inside (used by readers to
//! prune whole branches during keyed queries).
//!
//! Categories with enough features get their own sub-index, up to
//! `max_key_indexes`; everything else lands in the mixed sub-index.

use crate::geom::Bbox;

#[derive(Copy, Clone, Debug)]
pub struct SpatialItem {
    /// caller-defined feature slot
    pub slot: u32,
    pub hilbert: u32,
    pub bounds: Bbox,
    /// bit (category - 1) set for every indexed-key category on the feature
    pub key_bits: u32,
}

#[derive(Debug)]
pub struct Branch {
    pub bounds: Bbox,
    pub key_bits: u32,
    pub first: u32,
    pub count: u32,
}

#[derive(Debug)]
pub struct SubIndex {
    /// 0 = the mixed sub-index
    pub category: u32,
    pub items: Vec<SpatialItem>,
    pub branches: Vec<Branch>,
}

#[derive(Default, Debug)]
pub struct SpatialIndex {
    pub sub_indexes: Vec<SubIndex>,
}

impl SpatialIndex {
    pub fn feature_count(&self) -> usize {
        self.sub_indexes.iter().map(|s| s.items.len()).sum()
    }
}

pub fn build_index(
    mut items: Vec<SpatialItem>,
    branch_size: u32,
    max_key_indexes: u32,
    key_index_min_features: u32,
) -> SpatialIndex {
    let mut index = SpatialIndex::default();
    if items.is_empty() {
        return index;
    }

    // Pick the categories that earn their own sub-index: most features
    // first, lower category number on ties.
    let mut per_category = [0u32; 32];
    for item in &items {
        if item.key_bits != 0 {
            per_category[item.key_bits.trailing_zeros() as usize] += 1;
        }
    }
    let mut ranked: Vec<(u32, u32)> = per_category
        .iter()
        .enumerate()
        .filter(|&(_, &n)| n >= key_index_min_features)
        .map(|(cat0, &n)| (n, cat0 as u32 + 1))
        .collect();
    ranked.sort_by_key(|&(n, cat)| (std::cmp::Reverse(n), cat));
    ranked.truncate(max_key_indexes as usize);
    let mut keyed: u32 = 0;
    for &(_, cat) in &ranked {
        keyed |= 1 << (cat - 1);
    }

    let mut buckets: Vec<(u32, Vec<SpatialItem>)> =
        ranked.iter().map(|&(_, cat)| (cat, Vec::new())).collect();
    let mut mixed = Vec::new();
    items.sort_by_key(|i| (i.hilbert, i.slot));
    for item in items {
        let cat0 = if item.key_bits & keyed != 0 {
            Some((item.key_bits & keyed).trailing_zeros())
        } else {
            None
        };
        match cat0 {
            Some(cat0) => {
                let cat = cat0 + 1;
                buckets.iter_mut().find(|(c, _)| *c == cat).unwrap().1.push(item);
            }
            None => mixed.push(item),
        }
    }

    for (category, bucket) in
        buckets.into_iter().chain(std::iter::once((0, mixed))).filter(|(_, b)| !b.is_empty())
    {
        let branches = pack_branches(&bucket, branch_size);
        index.sub_indexes.push(SubIndex { category, items: bucket, branches });
    }
    index
}

fn pack_branches(items: &[SpatialItem], branch_size: u32) -> Vec<Branch> {
    let mut branches = Vec::with_capacity(items.len().div_ceil(branch_size as usize));
    for (bi, chunk) in items.chunks(branch_size as usize).enumerate() {
        let mut bounds = Bbox::empty();
        let mut key_bits = 0;
        for item in chunk {
            bounds.expand_to_include_box(&item.bounds);
            key_bits |= item.key_bits;
        }
        branches.push(Branch {
            bounds,
            key_bits,
            first: (bi * branch_size as usize) as u32,
            count: chunk.len() as u32,
        });
    }
    branches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Coordinate;

    fn item(slot: u32, x: i32, y: i32, key_bits: u32) -> SpatialItem {
        let mut bounds = Bbox::empty();
        bounds.expand_to_include(Coordinate::new(x, y));
        bounds.expand_to_include(Coordinate::new(x + 10, y + 10));
        SpatialItem {
            slot,
            hilbert: crate::geom::hilbert_distance((x as u32) & 0xffff, (y as u32) & 0xffff),
            bounds,
            key_bits,
        }
    }

    #[test]
    fn branches_respect_branch_size_and_cover_items() {
        let items: Vec<_> = (0..37).map(|i| item(i, (i as i32) * 100, 50, 0)).collect();
        let index = build_index(items, 16, 8, 300);
        assert_eq!(index.sub_indexes.len(), 1);
        let sub = &index.sub_indexes[0];
        assert_eq!(sub.category, 0);
        assert_eq!(sub.branches.len(), 3); // 16 + 16 + 5
        assert_eq!(sub.branches[2].count, 5);
        assert_eq!(index.feature_count(), 37);
        // every item's bounds are inside its branch bounds
        for branch in &sub.branches {
            for item in
                &sub.items[branch.first as usize..(branch.first + branch.count) as usize]
            {
                assert!(branch.bounds.contains_box(&item.bounds));
            }
        }
    }

    #[test]
    fn items_are_in_hilbert_order() {
        let items: Vec<_> =
            (0..100).map(|i| item(i, (i as i32 * 37) % 1000, (i as i32 * 91) % 1000, 0)).collect();
        let index = build_index(items, 16, 8, 300);
        let sub = &index.sub_indexes[0];
        for pair in sub.items.windows(2) {
            assert!(pair[0].hilbert <= pair[1].hilbert);
        }
    }

    #[test]
    fn popular_categories_get_their_own_sub_index() {
        let mut items = Vec::new();
        for i in 0..20 {
            items.push(item(i, i as i32 * 10, 0, 1)); // category 1
        }
        for i in 20..25 {
            items.push(item(i, i as i32 * 10, 0, 2)); // category 2, few
        }
        items.push(item(25, 0, 500, 0)); // uncategorized
        let index = build_index(items, 4, 8, 10);
        let cats: Vec<u32> = index.sub_indexes.iter().map(|s| s.category).collect();
        assert_eq!(cats, vec![1, 0]);
        assert_eq!(index.sub_indexes[0].items.len(), 20);
        // the small category folded into the mixed index
        assert_eq!(index.sub_indexes[1].items.len(), 6);
        // key bits survive in branches for pruning
        assert!(index.sub_indexes[1].branches.iter().any(|b| b.key_bits & 2 != 0));
    }
}
