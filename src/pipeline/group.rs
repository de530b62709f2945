//! Invert per-response assignments into per-tag groups.

use super::types::{GroupMember, ResponseTagAssignment, TagGroups};

/// One group per normalized tag, in order of first appearance. A response
/// appears in a group exactly when the tag is in its assignment.
pub fn group_by_tag(responses: &[String], assignments: &[ResponseTagAssignment]) -> TagGroups {
    let mut groups = TagGroups::new();
    for assignment in assignments {
        let Some(response) = responses.get(assignment.response_index) else {
            continue;
        };
        for tag in &assignment.normalized_tags {
            groups.entry(tag.clone()).or_default().push(GroupMember {
                index: assignment.response_index,
                response: response.clone(),
            });
        }
    }
    groups
}
