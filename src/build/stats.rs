use std::ops::AddAssign;

/// Totals gathered by the analyze phase. Max ids rely on the source
/// ordering (ids are non-decreasing within each feature type).
#[derive(Copy, Clone, Default, Debug)]
pub struct OsmStats {
    pub node_count: u64,
    pub way_count: u64,
    pub relation_count: u64,
    pub tag_count: u64,
    pub member_count: u64,
    pub max_node_id: i64,
    pub max_way_id: i64,
    pub max_relation_id: i64,
}

impl OsmStats {
    pub fn primitive_count(&self) -> u64 {
        self.node_count + self.way_count + self.relation_count
    }
}

impl AddAssign for OsmStats {
    fn add_assign(&mut self, other: Self) {
        self.node_count += other.node_count;
        self.way_count += other.way_count;
        self.relation_count += other.relation_count;
        self.tag_count += other.tag_count;
        self.member_count += other.member_count;
        self.max_node_id = self.max_node_id.max(other.max_node_id);
        self.max_way_id = self.max_way_id.max(other.max_way_id);
        self.max_relation_id = self.max_relation_id.max(other.max_relation_id);
    }
}

/// Totals gathered by the sort phase.
#[derive(Copy, Clone, Default, Debug)]
pub struct SortStats {
    pub node_count: u64,
    pub way_count: u64,
    pub multitile_way_count: u64,
    pub ghost_way_count: u64,
    pub way_node_count: u64,
    pub relation_count: u64,
    pub super_relation_count: u64,
    pub empty_relation_count: u64,
    pub ref_cycle_count: u64,
    pub member_count: u64,
    pub foreign_member_count: u64,
    pub missing_node_count: u64,
    pub rejected_way_count: u64,
}

impl AddAssign for SortStats {
    fn add_assign(&mut self, other: Self) {
        self.node_count += other.node_count;
        self.way_count += other.way_count;
        self.multitile_way_count += other.multitile_way_count;
        self.ghost_way_count += other.ghost_way_count;
        self.way_node_count += other.way_node_count;
        self.relation_count += other.relation_count;
        self.super_relation_count += other.super_relation_count;
        self.empty_relation_count += other.empty_relation_count;
        self.ref_cycle_count += other.ref_cycle_count;
        self.member_count += other.member_count;
        self.foreign_member_count += other.foreign_member_count;
        self.missing_node_count += other.missing_node_count;
        self.rejected_way_count += other.rejected_way_count;
    }
}
