//! Checkpoint cost model.
//!
//! The cost model assigns budget units to injected checkpoints.

/// How many instructions one budget unit covers.
pub const INSTRS_PER_COST_UNIT: usize = 16;

/// Estimated cost charged at a checkpoint guarding a region of
/// `instruction_count` instructions. Always at least 1, so a tight loop
/// still drains its budget.
pub fn checkpoint_cost(instruction_count: usize) -> i64 {
    std::cmp::max(1, (instruction_count / INSTRS_PER_COST_UNIT) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_regions_cost_one_unit() {
        assert_eq!(checkpoint_cost(0), 1);
        assert_eq!(checkpoint_cost(15), 1);
        assert_eq!(checkpoint_cost(16), 1);
        assert_eq!(checkpoint_cost(32), 2);
        assert_eq!(checkpoint_cost(33), 2);
    }
}
