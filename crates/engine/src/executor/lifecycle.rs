//! Per-resource provisioning state machine.
//!
//! ```text
//! Pending ──Start──▶ InProgress ──Succeed──▶ Created
//!                        │  └──────Delete──▶ Deleted
//!                        └──Fail──▶ Failed
//! ```
//!
//! `Created`, `Failed` and `Deleted` may be started again (update, retry,
//! teardown or re-create). `Reset` returns any state to `Pending`.

use strata_types::ProvisioningStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    /// A provider call was issued.
    Start,
    /// A create or update call succeeded.
    Succeed,
    /// The call failed for good.
    Fail,
    /// The resource is gone, or intentionally left behind.
    Delete,
    Reset,
}

/// Next status, or `None` when the input is not valid in `status`.
pub fn transition(status: ProvisioningStatus, input: LifecycleInput) -> Option<ProvisioningStatus> {
    use LifecycleInput as I;
    use ProvisioningStatus as S;

    match (status, input) {
        (_, I::Reset) => Some(S::Pending),
        (S::Pending | S::Created | S::Failed | S::Deleted, I::Start) => Some(S::InProgress),
        (S::InProgress, I::Succeed) => Some(S::Created),
        (S::InProgress, I::Fail) => Some(S::Failed),
        (S::InProgress | S::Created | S::Failed, I::Delete) => Some(S::Deleted),
        _ => None,
    }
}
