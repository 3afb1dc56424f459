use dddkit::prelude::*;
use dddkit::types::{StateMachineDefinition, StateTransition};
use std::sync::Arc;

base_enum! {
    pub enum LeaveStatus {
        Draft = "draft" ("Draft"),
        Submitted = "submitted" ("Submitted"),
        Approved = "approved" ("Approved"),
        Rejected = "rejected" ("Rejected"),
    }
}

base_enum! {
    pub enum LeaveAction {
        Submit = "submit" ("Submit"),
        Approve = "approve" ("Approve"),
        Reject = "reject" ("Reject"),
    }
}

fn leave_schema() -> Result<Arc<EntitySchema>> {
    EntitySchema::builder("LeaveRequestAggregate")
        .field(FieldInfo::string("leave_id").primary_key())
        .field(FieldInfo::integer("days"))
        .field(
            FieldInfo::enumeration("status", LeaveStatus::enum_type())
                .default_value(LeaveStatus::Draft),
        )
        .state_machine(
            StateMachineDefinition::new("status")
                .transition(StateTransition::new(
                    LeaveAction::Submit,
                    &[LeaveStatus::Draft, LeaveStatus::Rejected],
                    LeaveStatus::Submitted,
                ))
                .transition(
                    StateTransition::new(
                        LeaveAction::Approve,
                        &[LeaveStatus::Submitted],
                        LeaveStatus::Approved,
                    )
                    .roles(["manager"]),
                )
                .transition(
                    StateTransition::new(
                        LeaveAction::Reject,
                        &[LeaveStatus::Submitted],
                        LeaveStatus::Rejected,
                    )
                    .roles(["manager"]),
                ),
        )
        .build()
}

aggregate! {
    pub struct LeaveRequestAggregate => leave_schema;
}

fn leave() -> LeaveRequestAggregate {
    let mut leave = LeaveRequestAggregate::create(
        attrs! { "leave_id" => "lv-1", "days" => 3 },
        &RequestContext::default(),
    )
    .unwrap();
    leave.mark_persisted();
    leave
}

fn status(leave: &LeaveRequestAggregate) -> LeaveStatus {
    leave.get_enum("status").unwrap()
}

#[test]
fn test_invalid_trigger_leaves_state_alone() {
    let mut leave = leave();
    let err = leave
        .act(ActionRequest::new(LeaveAction::Approve), &[UserRole::new("manager")])
        .unwrap_err();
    assert!(matches!(err, DomainError::Validation { .. }));
    assert_eq!(status(&leave), LeaveStatus::Draft);
    assert!(leave.action_log().is_empty());
}

#[test]
fn test_missing_role_is_an_authorization_failure() {
    let mut leave = leave();
    leave.act(ActionRequest::new(LeaveAction::Submit), &[]).unwrap();

    let err = leave
        .act(ActionRequest::new(LeaveAction::Approve), &[UserRole::new("staff")])
        .unwrap_err();
    assert!(matches!(err, DomainError::Authorization(_)));
    assert_eq!(status(&leave), LeaveStatus::Submitted);
    assert_eq!(leave.action_log().len(), 1);
}

#[test]
fn test_successful_act_moves_state_and_logs_once() {
    let mut leave = leave();
    leave.act(ActionRequest::new(LeaveAction::Submit), &[]).unwrap();
    assert_eq!(status(&leave), LeaveStatus::Submitted);
    assert_eq!(leave.action_log().len(), 1);

    leave
        .act(ActionRequest::new(LeaveAction::Reject), &[UserRole::new("manager")])
        .unwrap();
    leave.act(ActionRequest::new(LeaveAction::Submit), &[]).unwrap();
    leave
        .act(ActionRequest::new(LeaveAction::Approve), &[UserRole::new("manager")])
        .unwrap();

    assert_eq!(status(&leave), LeaveStatus::Approved);
    let log = leave.action_log();
    assert_eq!(log.len(), 4);
    assert_eq!(log[3].old_state, "submitted");
    assert!(leave.has_actions());
    // one version bump for the whole episode
    assert_eq!(leave.version(), 2);
}

#[test]
fn test_state_cannot_be_set_directly() {
    let mut leave = leave();
    let err = leave.set("status", LeaveStatus::Approved).unwrap_err();
    assert!(matches!(err, DomainError::InvalidState(_)));
    assert_eq!(status(&leave), LeaveStatus::Draft);
}

#[test]
fn test_data_lists_available_transitions() {
    let mut leave = leave();
    leave.act(ActionRequest::new(LeaveAction::Submit), &[]).unwrap();
    let data = leave.data();
    let triggers: Vec<&str> = data["transitions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["trigger"].as_str())
        .collect();
    assert_eq!(triggers, ["approve", "reject"]);
}
