//! Room invariants and developer guardrails
//!
//! [`check_room_invariants`] runs inside every membership transaction before
//! commit. The `assert_*` helpers are debug assertions for impossible states
//! and compile out in release builds.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Membership, Message, RoomRole};

/// Verify the committed-state invariants for one room's memberships.
///
/// * exactly one active owner
/// * at most `max_sub_managers` active sub-managers
/// * only sub-managers carry a permission set
pub fn check_room_invariants(memberships: &[Membership], max_sub_managers: usize) -> Result<()> {
    let owners = memberships.iter().filter(|m| m.is_owner()).count();
    if owners != 1 {
        return Err(Error::invariant(format!(
            "room must have exactly one active owner, found {}",
            owners
        )));
    }

    let sub_managers = memberships.iter().filter(|m| m.is_sub_manager()).count();
    if sub_managers > max_sub_managers {
        return Err(Error::invariant(format!(
            "at most {} sub-managers allowed",
            max_sub_managers
        )));
    }

    if let Some(m) = memberships
        .iter()
        .find(|m| m.role != RoomRole::SubManager && !m.permissions.is_empty())
    {
        return Err(Error::invariant(format!(
            "member {} holds permissions without being a sub-manager",
            m.user_id
        )));
    }

    Ok(())
}

/// Validate that a membership is well formed
pub fn assert_membership_invariants(membership: &Membership) {
    debug_assert!(
        membership.user_id != Uuid::nil(),
        "Membership {} has nil user_id",
        membership.id
    );

    debug_assert!(
        membership.room_id != Uuid::nil(),
        "Membership {} has nil room_id",
        membership.id
    );
}

/// Validate that a snapshot is in stream order with no duplicates
pub fn assert_stream_order(messages: &[Message]) {
    for pair in messages.windows(2) {
        debug_assert!(
            pair[0].stream_order(&pair[1]).is_lt(),
            "Messages {} and {} are out of order or duplicated",
            pair[0].id,
            pair[1].id
        );
    }
}

/// Validate that a pagination limit never shrinks
pub fn assert_limit_monotonic(previous: usize, next: usize) {
    debug_assert!(
        next >= previous,
        "Window limit shrank from {} to {}",
        previous,
        next
    );
}
