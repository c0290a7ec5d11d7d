//! Static event-to-role targeting. Exhaustive matches over the closed
//! event enumeration keep an unhandled event a compile-time gap.

use crate::mediation::types::EventType;

/// Recipient role groups. Operators are resolved through site assignments;
/// monitors and workers through organization membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleGroup {
    Operator,
    Monitor,
    Worker,
}

/// Which role groups an event reaches. Events with no targets short-circuit
/// routing entirely.
pub fn target_roles(event_type: EventType) -> &'static [RoleGroup] {
    match event_type {
        EventType::MaterialRequest => &[RoleGroup::Operator],
        EventType::Issue
        | EventType::StatusChange
        | EventType::Milestone
        | EventType::WorkerArrival
        | EventType::WorkerDeparture => &[RoleGroup::Monitor],
        EventType::Inspection => &[RoleGroup::Worker, RoleGroup::Operator],
        EventType::Alert => &[RoleGroup::Monitor, RoleGroup::Operator],
        EventType::Note | EventType::CalendarEvent => &[],
    }
}

/// App names whose device registrations are relevant for a role group.
pub fn app_names(role: RoleGroup) -> &'static [&'static str] {
    match role {
        RoleGroup::Worker => &["field"],
        RoleGroup::Operator => &["office"],
        RoleGroup::Monitor => &["field", "office"],
    }
}

/// Client-side channel hint carried on each push payload.
pub fn channel_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::MaterialRequest => "materials",
        EventType::Alert => "alerts",
        EventType::Issue | EventType::Inspection => "quality",
        EventType::StatusChange | EventType::Milestone => "progress",
        EventType::WorkerArrival | EventType::WorkerDeparture => "presence",
        EventType::Note | EventType::CalendarEvent => "general",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_requests_reach_operators_only() {
        assert_eq!(
            target_roles(EventType::MaterialRequest),
            &[RoleGroup::Operator]
        );
    }

    #[test]
    fn inspections_reach_workers_and_operators() {
        let roles = target_roles(EventType::Inspection);
        assert!(roles.contains(&RoleGroup::Worker));
        assert!(roles.contains(&RoleGroup::Operator));
        assert!(!roles.contains(&RoleGroup::Monitor));
    }

    #[test]
    fn notes_have_no_targets() {
        assert!(target_roles(EventType::Note).is_empty());
        assert!(target_roles(EventType::CalendarEvent).is_empty());
    }

    #[test]
    fn presence_events_reach_monitors() {
        assert_eq!(target_roles(EventType::WorkerArrival), &[RoleGroup::Monitor]);
        assert_eq!(
            target_roles(EventType::WorkerDeparture),
            &[RoleGroup::Monitor]
        );
    }

    #[test]
    fn monitors_see_both_apps() {
        assert_eq!(app_names(RoleGroup::Monitor), &["field", "office"]);
        assert_eq!(app_names(RoleGroup::Worker), &["field"]);
    }
}
