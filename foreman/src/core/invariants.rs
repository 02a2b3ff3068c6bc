//! Milestone ordering invariants not expressible via JSON Schema.

use std::collections::HashMap;

use crate::core::types::Milestone;

/// Check that sequence numbers are unique per task and that each task's
/// milestones are stored in strictly increasing sequence order.
pub fn validate_milestone_order(milestones: &[Milestone]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut last_by_task: HashMap<u64, u32> = HashMap::new();

    for milestone in milestones {
        if milestone.sequence == 0 {
            errors.push(format!(
                "milestone {}: sequence must be > 0",
                milestone.id
            ));
        }
        if let Some(&previous) = last_by_task.get(&milestone.task_id) {
            if milestone.sequence == previous {
                errors.push(format!(
                    "task {}: duplicate milestone sequence {}",
                    milestone.task_id, milestone.sequence
                ));
            } else if milestone.sequence < previous {
                errors.push(format!(
                    "task {}: milestone sequence {} follows {}",
                    milestone.task_id, milestone.sequence, previous
                ));
            }
        }
        last_by_task.insert(milestone.task_id, milestone.sequence);
    }

    errors
}

/// Whether `sequence` may be appended after the task's existing milestones.
pub fn can_append_sequence(existing: &[Milestone], task_id: u64, sequence: u32) -> bool {
    sequence > 0
        && existing
            .iter()
            .filter(|m| m.task_id == task_id)
            .all(|m| m.sequence < sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::role::AgentRole;
    use crate::core::status::MilestoneStatus;
    use chrono::Utc;
    use serde_json::Value;

    fn milestone(id: u64, task_id: u64, sequence: u32) -> Milestone {
        let now = Utc::now();
        Milestone {
            id,
            task_id,
            sequence,
            title: format!("m{id}"),
            description: String::new(),
            agent_role: AgentRole::Dev,
            status: MilestoneStatus::Pending,
            input_data: Value::Null,
            output_data: None,
            metadata: Value::Null,
            failure_reason: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn accepts_strictly_increasing_sequences() {
        let list = vec![milestone(1, 1, 1), milestone(2, 1, 2), milestone(3, 2, 1)];
        assert!(validate_milestone_order(&list).is_empty());
    }

    #[test]
    fn reports_duplicates_and_regressions() {
        let list = vec![milestone(1, 1, 2), milestone(2, 1, 2), milestone(3, 1, 1)];
        let errors = validate_milestone_order(&list);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("duplicate"));
    }

    #[test]
    fn append_requires_a_larger_sequence() {
        let list = vec![milestone(1, 1, 1), milestone(2, 1, 2)];
        assert!(can_append_sequence(&list, 1, 3));
        assert!(!can_append_sequence(&list, 1, 2));
        assert!(can_append_sequence(&list, 9, 1));
        assert!(!can_append_sequence(&list, 9, 0));
    }
}
