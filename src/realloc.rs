//! Resolution of reallocation requests. Deciding what a `realloc` should do
//! is pure arithmetic over the old and new block sizes, so it lives here on
//! its own where it can be tested without a heap. Carrying out the plan is
//! the business of [`crate::heap`].

use crate::tag::MIN_BLOCK_SIZE;

/// What to do with a block whose payload is being resized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The block already fits, or the spare room is too small to stand on
    /// its own as a block. Hand the same pointer back.
    Keep,
    /// Carve the last `tail` bytes off into a new free block and keep the
    /// front in place.
    ShrinkInPlace { tail: usize },
    /// The block is too small: allocate elsewhere, copy, free.
    Move,
}

/// Picks a plan given the current total block size and the adjusted total
/// size the request needs. Both are multiples of 8.
pub(crate) fn plan(old_size: usize, adjusted: usize) -> Plan {
    if adjusted > old_size {
        return Plan::Move;
    }

    let spare = old_size - adjusted;

    // A tail smaller than a minimum block cannot hold its own tags and
    // links, so shrinking in place would corrupt the neighbor. Not worth it.
    if spare <= MIN_BLOCK_SIZE {
        Plan::Keep
    } else {
        Plan::ShrinkInPlace { tail: spare }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table() {
        let cases = [
            // Same size is always a keep.
            (64, 64, Plan::Keep),
            // Spare room up to one minimum block is not worth splitting.
            (64, 48, Plan::Keep),
            (64 + MIN_BLOCK_SIZE, 64, Plan::Keep),
            // One byte past that and the tail becomes a real block.
            (64 + MIN_BLOCK_SIZE + 8, 64, Plan::ShrinkInPlace { tail: MIN_BLOCK_SIZE + 8 }),
            (1008, 112, Plan::ShrinkInPlace { tail: 896 }),
            // Growing always moves.
            (64, 72, Plan::Move),
            (MIN_BLOCK_SIZE, 4096, Plan::Move),
        ];

        for (old_size, adjusted, expected) in cases {
            assert_eq!(plan(old_size, adjusted), expected, "plan({old_size}, {adjusted})");
        }
    }
}
