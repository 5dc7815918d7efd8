//! Audit search filters

use crate::audit::event::{AuditEvent, AuditEventType, Severity};
use chrono::{DateTime, Utc};

/// Default maximum number of events returned by a search
pub const DEFAULT_SEARCH_LIMIT: usize = 100;

/// Filter over audit events; every supplied criterion must match
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Inclusive lower bound on the event timestamp
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the event timestamp
    pub end_time: Option<DateTime<Utc>>,
    /// Accepted event types; the event must be one of them
    pub event_types: Option<Vec<AuditEventType>>,
    pub user_id: Option<String>,
    pub provider: Option<String>,
    pub severity: Option<Severity>,
    pub limit: usize,
    /// Also scan rotated, gzip-compressed files
    pub include_archived: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            event_types: None,
            user_id: None,
            provider: None,
            severity: None,
            limit: DEFAULT_SEARCH_LIMIT,
            include_archived: false,
        }
    }
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn until(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn event_types(mut self, event_types: impl IntoIterator<Item = AuditEventType>) -> Self {
        self.event_types = Some(event_types.into_iter().collect());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn include_archived(mut self, include: bool) -> Self {
        self.include_archived = include;
        self
    }

    /// Whether `event` satisfies every supplied filter
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(start) = self.start_time {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if event.timestamp > end {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if &event.user_id != user_id {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &event.provider != provider {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if event.severity != severity {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(provider: &str, severity: Severity) -> AuditEvent {
        AuditEvent::new(AuditEventType::CredentialCreated, "alice", provider, severity)
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let query = SearchQuery::new();
        assert_eq!(query.limit, DEFAULT_SEARCH_LIMIT);
        assert!(!query.include_archived);
        assert!(query.matches(&event("a", Severity::Low)));
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let query = SearchQuery::new().provider("a").severity(Severity::High);

        assert!(query.matches(&event("a", Severity::High)));
        assert!(!query.matches(&event("a", Severity::Low)));
        assert!(!query.matches(&event("b", Severity::High)));
    }

    #[test]
    fn test_event_type_set() {
        let query = SearchQuery::new().event_types([
            AuditEventType::AccessDenied,
            AuditEventType::CredentialCreated,
        ]);
        assert!(query.matches(&event("a", Severity::Low)));

        let query = SearchQuery::new().event_types([AuditEventType::AccessDenied]);
        assert!(!query.matches(&event("a", Severity::Low)));
    }

    #[test]
    fn test_time_bounds_are_inclusive() {
        let e = event("a", Severity::Low);
        let query = SearchQuery::new().since(e.timestamp).until(e.timestamp);
        assert!(query.matches(&e));

        let query = SearchQuery::new().since(e.timestamp + Duration::seconds(1));
        assert!(!query.matches(&e));

        let query = SearchQuery::new().until(e.timestamp - Duration::seconds(1));
        assert!(!query.matches(&e));
    }

    #[test]
    fn test_user_filter() {
        let query = SearchQuery::new().user_id("bob");
        assert!(!query.matches(&event("a", Severity::Low)));
        assert!(SearchQuery::new().user_id("alice").matches(&event("a", Severity::Low)));
    }
}
