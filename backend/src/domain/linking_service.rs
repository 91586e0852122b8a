use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use shared::{AuditAction, LinkingMethod, QrMode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

use super::credential_service::{CredentialService, CredentialView};
use super::linking_wizard::{transition, ChildDraft, LinkingOutcome, LinkingSession, WizardEvent};
use super::models::{ActorContext, AuditEvent, Child, RosterRecord};
use crate::storage::traits::{AuditSink, ChildStorage, RosterLookup};

/// Sessions untouched for this long are dropped when the next one starts
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkingError {
    #[error("Linking session not found: {0}")]
    SessionNotFound(String),
    #[error("Linking session {0} is already completed")]
    SessionClosed(String),
    #[error("No roster record matches code {0}")]
    UnknownRosterCode(String),
    #[error("Existing child not found: {0}")]
    ExistingChildNotFound(String),
}

/// What finishing a session actually did
#[derive(Debug, Clone, PartialEq)]
pub enum LinkingCompletion {
    Created {
        child: Child,
        credential: Option<CredentialView>,
    },
    Linked {
        child: Child,
        credential: Option<CredentialView>,
    },
    AttachedToExisting {
        child: Child,
    },
    CreatedWithRosterCorrection {
        child: Child,
        credential: Option<CredentialView>,
    },
    DuplicateAcknowledged {
        code: String,
    },
}

/// Result of applying one event to a session
#[derive(Debug, Clone, PartialEq)]
pub enum EventResult {
    InProgress(LinkingSession),
    Completed(LinkingCompletion),
}

/// Credential to issue automatically when a new child is linked
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoIssue {
    pub mode: QrMode,
    pub rotation_interval_minutes: Option<i64>,
}

struct SessionState {
    session: LinkingSession,
    /// Outcome already stored and audited, kept while auto-issue is pending
    handed_off: Option<(LinkingOutcome, LinkingCompletion)>,
}

struct SessionSlot {
    state: Arc<AsyncMutex<SessionState>>,
    last_touched: Instant,
    /// Child id allocated to this session; stays fixed across retries
    child_id: Option<String>,
}

/// Service that drives linking sessions and hands completed ones to storage.
///
/// Sessions only live in memory. Nothing is written until a session completes.
/// A failed handoff leaves the session on its Review step so the guardian can
/// retry, and a retry never writes the child or its audit event twice: the
/// child id is reserved once per session and an outcome that was already
/// stored is reused.
#[derive(Clone)]
pub struct LinkingService {
    sessions: Arc<Mutex<HashMap<String, SessionSlot>>>,
    id_allocation: Arc<AsyncMutex<()>>,
    session_timeout: Duration,
    children: Arc<dyn ChildStorage>,
    roster: Arc<dyn RosterLookup>,
    audit: Arc<dyn AuditSink>,
    credentials: CredentialService,
    auto_issue: Option<AutoIssue>,
}

impl LinkingService {
    pub fn new(
        children: Arc<dyn ChildStorage>,
        roster: Arc<dyn RosterLookup>,
        audit: Arc<dyn AuditSink>,
        credentials: CredentialService,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            id_allocation: Arc::new(AsyncMutex::new(())),
            session_timeout: SESSION_IDLE_TIMEOUT,
            children,
            roster,
            audit,
            credentials,
            auto_issue: None,
        }
    }

    /// Issue a credential for every newly created or linked child
    pub fn with_auto_issue(mut self, auto_issue: AutoIssue) -> Self {
        self.auto_issue = Some(auto_issue);
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    fn with_slot<T>(&self, session_id: &str, f: impl FnOnce(&mut SessionSlot) -> T) -> Result<T> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(session_id) {
            Some(slot) => Ok(f(slot)),
            None => Err(LinkingError::SessionNotFound(session_id.to_string()).into()),
        }
    }

    fn session_entry(&self, session_id: &str) -> Result<Arc<AsyncMutex<SessionState>>> {
        self.with_slot(session_id, |slot| {
            slot.last_touched = Instant::now();
            slot.state.clone()
        })
    }

    fn remove_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(session_id).is_some()
    }

    /// Start a new wizard session, dropping any that have sat idle too long
    pub fn start_session(&self) -> (String, LinkingSession) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = LinkingSession::new();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);

        let before = sessions.len();
        sessions.retain(|_, slot| slot.last_touched.elapsed() < self.session_timeout);
        if sessions.len() < before {
            info!("Expired {} idle linking sessions", before - sessions.len());
        }

        sessions.insert(
            session_id.clone(),
            SessionSlot {
                state: Arc::new(AsyncMutex::new(SessionState {
                    session: session.clone(),
                    handed_off: None,
                })),
                last_touched: Instant::now(),
                child_id: None,
            },
        );
        info!("Started linking session {}", session_id);
        (session_id, session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<LinkingSession> {
        let entry = self.session_entry(session_id)?;
        let state = entry.lock().await;
        Ok(state.session.clone())
    }

    /// Abandon a session; all of its fields are discarded
    pub fn cancel_session(&self, session_id: &str) -> Result<()> {
        if self.remove_session(session_id) {
            info!("Cancelled linking session {}", session_id);
            Ok(())
        } else {
            warn!("Cannot cancel unknown linking session {}", session_id);
            Err(LinkingError::SessionNotFound(session_id.to_string()).into())
        }
    }

    /// Apply a wizard event. When the event completes the session, the outcome
    /// is handed off and the session is removed.
    pub async fn apply_event(
        &self,
        session_id: &str,
        event: WizardEvent,
        actor: &ActorContext,
    ) -> Result<EventResult> {
        let entry = self.session_entry(session_id)?;
        let mut state = entry.lock().await;
        if state.session.is_completed() {
            return Err(LinkingError::SessionClosed(session_id.to_string()).into());
        }

        if event == WizardEvent::Next {
            if let Err(reason) = state.session.advance_guard() {
                warn!("Session {} cannot advance: {}", session_id, reason);
            }
        }
        let next = transition(&state.session, event);

        let outcome = match next.outcome() {
            Some(outcome) => outcome,
            None => {
                state.session = next.clone();
                return Ok(EventResult::InProgress(next));
            }
        };

        let handed_off = match &state.handed_off {
            Some((done, completion)) if *done == outcome => Some(completion.clone()),
            _ => None,
        };
        let completion = match handed_off {
            Some(completion) => {
                info!("Linking session {} already handed off, retrying issuance", session_id);
                completion
            }
            None => {
                info!("Completing linking session {} with {:?}", session_id, outcome);
                let completion = self.complete(session_id, outcome.clone(), actor).await?;
                state.handed_off = Some((outcome, completion.clone()));
                completion
            }
        };

        let completion = self.issue_initial_credential(completion, actor).await?;

        state.session = next;
        state.handed_off = None;
        self.remove_session(session_id);
        info!("Linking session {} completed", session_id);
        Ok(EventResult::Completed(completion))
    }

    async fn complete(
        &self,
        session_id: &str,
        outcome: LinkingOutcome,
        actor: &ActorContext,
    ) -> Result<LinkingCompletion> {
        match outcome {
            LinkingOutcome::CreateChild(draft) => {
                let child_id = self.reserve_child_id(session_id).await?;
                let child = Self::new_child_from_draft(child_id, draft);
                self.children.store_child(&child).await?;
                self.record(actor, AuditAction::ChildCreated, Some(&child.id), format!("created {}", child.name))
                    .await?;
                Ok(LinkingCompletion::Created { child, credential: None })
            }
            LinkingOutcome::LinkByCode { method, code } => {
                let record = self.roster_record(&code).await?;
                let child_id = self.reserve_child_id(session_id).await?;
                let child = Self::new_child_from_roster(child_id, method, record);
                self.children.store_child(&child).await?;
                self.record(
                    actor,
                    AuditAction::ChildLinked,
                    Some(&child.id),
                    format!("{:?} with code {}", method, code),
                )
                .await?;
                Ok(LinkingCompletion::Linked { child, credential: None })
            }
            LinkingOutcome::AttachToExisting { code, child_id } => {
                let child = match self.children.get_child(&child_id).await? {
                    Some(child) => child,
                    None => return Err(LinkingError::ExistingChildNotFound(child_id).into()),
                };
                self.record(
                    actor,
                    AuditAction::AttachedToExisting,
                    Some(&child.id),
                    format!("conflicting code {} attached to existing child", code),
                )
                .await?;
                Ok(LinkingCompletion::AttachedToExisting { child })
            }
            LinkingOutcome::CreateFromConflict { method, code } => {
                let record = self.roster_record(&code).await?;
                let child_id = self.reserve_child_id(session_id).await?;
                let child = Self::new_child_from_roster(child_id, method, record);
                self.children.store_child(&child).await?;
                self.record(
                    actor,
                    AuditAction::ChildCreated,
                    Some(&child.id),
                    format!("roster mismatch for code {}; correction requested", code),
                )
                .await?;
                Ok(LinkingCompletion::CreatedWithRosterCorrection { child, credential: None })
            }
            LinkingOutcome::DuplicateAcknowledged { code } => {
                self.record(
                    actor,
                    AuditAction::DuplicateAcknowledged,
                    None,
                    format!("code {} already linked; nothing created", code),
                )
                .await?;
                Ok(LinkingCompletion::DuplicateAcknowledged { code })
            }
        }
    }

    /// Issuing is its own audited action. A failure is returned to the caller
    /// and the session stays open so the next attempt only re-issues.
    async fn issue_initial_credential(
        &self,
        completion: LinkingCompletion,
        actor: &ActorContext,
    ) -> Result<LinkingCompletion> {
        let auto_issue = match self.auto_issue {
            Some(auto_issue) => auto_issue,
            None => return Ok(completion),
        };

        let completion = match completion {
            LinkingCompletion::Created { child, .. } => {
                let credential = Some(self.issue_for(&child.id, auto_issue, actor).await?);
                LinkingCompletion::Created { child, credential }
            }
            LinkingCompletion::Linked { child, .. } => {
                let credential = Some(self.issue_for(&child.id, auto_issue, actor).await?);
                LinkingCompletion::Linked { child, credential }
            }
            LinkingCompletion::CreatedWithRosterCorrection { child, .. } => {
                let credential = Some(self.issue_for(&child.id, auto_issue, actor).await?);
                LinkingCompletion::CreatedWithRosterCorrection { child, credential }
            }
            other @ (LinkingCompletion::AttachedToExisting { .. }
            | LinkingCompletion::DuplicateAcknowledged { .. }) => other,
        };
        Ok(completion)
    }

    async fn issue_for(
        &self,
        child_id: &str,
        auto_issue: AutoIssue,
        actor: &ActorContext,
    ) -> Result<CredentialView> {
        self.credentials
            .issue(child_id, auto_issue.mode, auto_issue.rotation_interval_minutes, actor)
            .await
            .map_err(|e| {
                warn!("Initial QR credential for {} not issued: {}", child_id, e);
                e
            })
    }

    async fn roster_record(&self, code: &str) -> Result<RosterRecord> {
        match self.roster.find_by_code(code).await? {
            Some(record) => Ok(record),
            None => {
                warn!("No roster record for code {}", code);
                Err(LinkingError::UnknownRosterCode(code.to_string()).into())
            }
        }
    }

    async fn record(
        &self,
        actor: &ActorContext,
        action: AuditAction,
        child_id: Option<&str>,
        detail: String,
    ) -> Result<()> {
        self.audit
            .record(&AuditEvent::new(actor, action, child_id, detail))
            .await
    }

    fn is_reserved(&self, child_id: &str) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .values()
            .any(|slot| slot.child_id.as_deref() == Some(child_id))
    }

    /// Timestamp-based child id for a session, allocated once and kept until
    /// the session is removed
    async fn reserve_child_id(&self, session_id: &str) -> Result<String> {
        let _allocating = self.id_allocation.lock().await;
        if let Some(child_id) = self.with_slot(session_id, |slot| slot.child_id.clone())? {
            return Ok(child_id);
        }

        let mut millis = Utc::now().timestamp_millis().max(0) as u64;
        loop {
            let child_id = Child::generate_id(millis);
            if !self.is_reserved(&child_id) && self.children.get_child(&child_id).await?.is_none() {
                self.with_slot(session_id, |slot| slot.child_id = Some(child_id.clone()))?;
                return Ok(child_id);
            }
            millis += 1;
        }
    }

    fn new_child_from_draft(id: String, draft: ChildDraft) -> Child {
        Child {
            id,
            name: draft.name,
            school: draft.school,
            class_name: draft.class_name,
            stream: draft.stream,
            date_of_birth: Some(draft.date_of_birth),
            currency: draft.currency,
            photo_requested: draft.photo_requested,
            linking_method: LinkingMethod::Create,
            linked_code: None,
            created_at: Utc::now(),
        }
    }

    fn new_child_from_roster(id: String, method: LinkingMethod, record: RosterRecord) -> Child {
        Child {
            id,
            name: record.name,
            school: record.school,
            class_name: record.class_name,
            stream: record.stream,
            date_of_birth: None,
            currency: Default::default(),
            photo_requested: false,
            linking_method: method,
            linked_code: Some(record.code),
            created_at: Utc::now(),
        }
    }

    /// The guardian's existing children, for the "link to existing" picker
    pub async fn existing_children(&self) -> Result<Vec<Child>> {
        self.children.list_children().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::qr_credential::{QrCredential, QrCredentialManager, SequenceTokenGenerator};
    use crate::storage::csv::test_utils::{sample_child, TestEnvironment};
    use crate::storage::csv::{ChildRepository, CredentialRepository, CsvAuditLog, CsvRosterDirectory};
    use crate::storage::traits::CredentialStorage;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use shared::{CodeStatus, ConflictChoice, WizardStep};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        env: TestEnvironment,
        service: LinkingService,
        children: Arc<ChildRepository>,
        audit: Arc<CsvAuditLog>,
        credentials: CredentialService,
        actor: ActorContext,
    }

    async fn setup_test() -> Fixture {
        let env = TestEnvironment::new().await.expect("Failed to create test environment");
        env.write_roster(&[
            ("EDU-4821-KLA", "Amani Okello", "Kampala Parents School", "P.5", "Blue"),
            ("CONFLICT", "Zawadi Nakato", "Greenhill Academy", "P.3", ""),
        ])
        .unwrap();

        let children = Arc::new(ChildRepository::new(env.connection.clone()));
        let audit = Arc::new(CsvAuditLog::new(env.connection.clone()));
        let credentials = CredentialService::new(
            QrCredentialManager::new(Arc::new(SequenceTokenGenerator::new()), "eduwallet"),
            children.clone(),
            Arc::new(CredentialRepository::new(env.connection.clone())),
            audit.clone(),
        );
        let service = LinkingService::new(
            children.clone(),
            Arc::new(CsvRosterDirectory::new(env.connection.clone())),
            audit.clone(),
            credentials.clone(),
        );

        Fixture {
            env,
            service,
            children,
            audit,
            credentials,
            actor: ActorContext::new("guardian_1", "Pixel 7"),
        }
    }

    impl Fixture {
        async fn run(&self, session_id: &str, events: Vec<WizardEvent>) -> Result<EventResult> {
            let mut last = None;
            for event in events {
                last = Some(self.service.apply_event(session_id, event, &self.actor).await?);
            }
            last.ok_or_else(|| anyhow::anyhow!("no events"))
        }

        async fn audit_actions(&self) -> Vec<AuditAction> {
            self.audit
                .recent_events(None)
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.action)
                .collect()
        }
    }

    fn code_events(method: LinkingMethod, code: &str) -> Vec<WizardEvent> {
        vec![
            WizardEvent::SelectMethod(method),
            WizardEvent::Next,
            WizardEvent::SetCode(code.to_string()),
        ]
    }

    fn finish_events() -> Vec<WizardEvent> {
        vec![WizardEvent::Next, WizardEvent::SetConfirmGuardian(true), WizardEvent::Next]
    }

    fn create_events() -> Vec<WizardEvent> {
        vec![
            WizardEvent::SelectMethod(LinkingMethod::Create),
            WizardEvent::Next,
            WizardEvent::SetChildName("Amani Okello".to_string()),
            WizardEvent::SetSchool("Kampala Parents School".to_string()),
            WizardEvent::SetClassName("P.5".to_string()),
            WizardEvent::SetDateOfBirth(NaiveDate::from_ymd_opt(2015, 6, 15)),
        ]
    }

    #[tokio::test]
    async fn test_create_flow_then_issue_dynamic_credential() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();

        let mut events = create_events();
        events.extend(finish_events());
        let child = match f.run(&session_id, events).await.unwrap() {
            EventResult::Completed(LinkingCompletion::Created { child, credential }) => {
                assert_eq!(credential, None);
                child
            }
            other => panic!("unexpected result: {:?}", other),
        };

        assert_eq!(child.name, "Amani Okello");
        assert_eq!(child.linking_method, LinkingMethod::Create);
        assert_eq!(f.children.get_child(&child.id).await.unwrap(), Some(child.clone()));
        assert_eq!(f.audit_actions().await, vec![AuditAction::ChildCreated]);

        let view = f
            .credentials
            .issue(&child.id, QrMode::Dynamic, Some(5), &f.actor)
            .await
            .unwrap();
        assert!(!view.credential.current_token.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_session_is_gone_after_completion() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();
        let mut events = create_events();
        events.extend(finish_events());
        f.run(&session_id, events).await.unwrap();

        let err = f.service.get_session(&session_id).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkingError>(),
            Some(&LinkingError::SessionNotFound(session_id.clone()))
        );
        assert!(f
            .service
            .apply_event(&session_id, WizardEvent::Back, &f.actor)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_incomplete_session_writes_nothing() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();
        let mut events = create_events();
        events.push(WizardEvent::Next);
        match f.run(&session_id, events).await.unwrap() {
            EventResult::InProgress(session) => assert_eq!(session.step(), WizardStep::Review),
            other => panic!("unexpected result: {:?}", other),
        }

        f.service.cancel_session(&session_id).unwrap();
        assert!(f.children.list_children().await.unwrap().is_empty());
        assert!(f.audit_actions().await.is_empty());
        assert!(f.service.cancel_session(&session_id).is_err());
    }

    #[tokio::test]
    async fn test_link_by_code_uses_roster() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();
        let mut events = code_events(LinkingMethod::SchoolInvite, "edu-4821-kla");
        events.extend(finish_events());

        match f.run(&session_id, events).await.unwrap() {
            EventResult::Completed(LinkingCompletion::Linked { child, .. }) => {
                assert_eq!(child.name, "Amani Okello");
                assert_eq!(child.stream.as_deref(), Some("Blue"));
                assert_eq!(child.linking_method, LinkingMethod::SchoolInvite);
                assert_eq!(child.linked_code.as_deref(), Some("EDU-4821-KLA"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(f.audit_actions().await, vec![AuditAction::ChildLinked]);
    }

    #[tokio::test]
    async fn test_unknown_roster_code_keeps_session_on_review() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();
        let mut events = code_events(LinkingMethod::Link, "NOT-ON-ROSTER");
        events.extend(finish_events());

        let err = f.run(&session_id, events).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkingError>(),
            Some(&LinkingError::UnknownRosterCode("NOT-ON-ROSTER".to_string()))
        );

        let session = f.service.get_session(&session_id).await.unwrap();
        assert_eq!(session.step(), WizardStep::Review);
        assert!(session.confirm_guardian());
        assert!(f.children.list_children().await.unwrap().is_empty());
        assert!(f.audit_actions().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_creates_nothing() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();

        let result = f.run(&session_id, code_events(LinkingMethod::Link, "DUPLICATE")).await.unwrap();
        match &result {
            EventResult::InProgress(session) => assert_eq!(session.code_status(), CodeStatus::Duplicate),
            other => panic!("unexpected result: {:?}", other),
        }

        let review = f.run(&session_id, vec![WizardEvent::Next]).await.unwrap();
        match review {
            EventResult::InProgress(session) => {
                assert_eq!(session.step(), WizardStep::Review);
                assert_eq!(
                    session.code_status_line(),
                    Some("Already linked to this guardian account")
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Completing needs the guardian's confirmation
        match f.run(&session_id, vec![WizardEvent::Next]).await.unwrap() {
            EventResult::InProgress(session) => assert_eq!(session.step(), WizardStep::Review),
            other => panic!("unexpected result: {:?}", other),
        }

        let done = f
            .run(&session_id, vec![WizardEvent::SetConfirmGuardian(true), WizardEvent::Next])
            .await
            .unwrap();
        assert_eq!(
            done,
            EventResult::Completed(LinkingCompletion::DuplicateAcknowledged {
                code: "DUPLICATE".to_string()
            })
        );
        assert!(f.children.list_children().await.unwrap().is_empty());
        assert_eq!(f.audit_actions().await, vec![AuditAction::DuplicateAcknowledged]);
    }

    #[tokio::test]
    async fn test_unresolved_conflict_cannot_reach_review() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();
        let mut events = code_events(LinkingMethod::Link, "CONFLICT");
        events.push(WizardEvent::Next);

        match f.run(&session_id, events).await.unwrap() {
            EventResult::InProgress(session) => {
                assert_eq!(session.step(), WizardStep::Details);
                assert_eq!(session.code_status(), CodeStatus::Conflict);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflict_create_new_flags_correction() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();
        let mut events = code_events(LinkingMethod::Link, "CONFLICT");
        events.push(WizardEvent::ChooseConflict(ConflictChoice::CreateNew));
        events.extend(finish_events());

        match f.run(&session_id, events).await.unwrap() {
            EventResult::Completed(LinkingCompletion::CreatedWithRosterCorrection { child, .. }) => {
                assert_eq!(child.name, "Zawadi Nakato");
                assert_eq!(child.stream, None);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let events = f.audit.recent_events(None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].detail.contains("correction requested"));
    }

    #[tokio::test]
    async fn test_conflict_link_to_existing() {
        let f = setup_test().await;
        f.children.store_child(&sample_child("child_7", "Amani Okello")).await.unwrap();
        assert_eq!(f.service.existing_children().await.unwrap().len(), 1);

        let (session_id, _) = f.service.start_session();
        let mut events = code_events(LinkingMethod::Link, "CONFLICT");
        events.push(WizardEvent::ChooseConflict(ConflictChoice::LinkToExisting));
        events.push(WizardEvent::SelectExistingChild("child_7".to_string()));
        events.extend(finish_events());

        match f.run(&session_id, events).await.unwrap() {
            EventResult::Completed(LinkingCompletion::AttachedToExisting { child }) => {
                assert_eq!(child.id, "child_7");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // No new child
        assert_eq!(f.children.list_children().await.unwrap().len(), 1);
        assert_eq!(f.audit_actions().await, vec![AuditAction::AttachedToExisting]);
    }

    #[tokio::test]
    async fn test_link_to_missing_existing_child_fails() {
        let f = setup_test().await;
        let (session_id, _) = f.service.start_session();
        let mut events = code_events(LinkingMethod::Link, "CONFLICT");
        events.push(WizardEvent::ChooseConflict(ConflictChoice::LinkToExisting));
        events.push(WizardEvent::SelectExistingChild("child_404".to_string()));
        events.extend(finish_events());

        let err = f.run(&session_id, events).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkingError>(),
            Some(&LinkingError::ExistingChildNotFound("child_404".to_string()))
        );
    }

    #[tokio::test]
    async fn test_auto_issue_on_link() {
        let f = setup_test().await;
        let service = f.service.clone().with_auto_issue(AutoIssue {
            mode: QrMode::Dynamic,
            rotation_interval_minutes: Some(5),
        });
        let (session_id, _) = service.start_session();
        let mut events = create_events();
        events.extend(finish_events());

        let mut result = None;
        for event in events {
            result = Some(service.apply_event(&session_id, event, &f.actor).await.unwrap());
        }

        match result {
            Some(EventResult::Completed(LinkingCompletion::Created { child, credential })) => {
                let credential = credential.expect("credential issued");
                assert_eq!(credential.credential.child_id, child.id);
                assert_eq!(credential.credential.current_token.as_deref(), Some("tok_000001"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            f.audit_actions().await,
            vec![AuditAction::CredentialIssued, AuditAction::ChildCreated]
        );
        assert!(f.env.base_path.join("children").exists());
    }

    struct FailingChildStore;

    #[async_trait]
    impl ChildStorage for FailingChildStore {
        async fn store_child(&self, _child: &Child) -> Result<()> {
            Err(anyhow::anyhow!("store unavailable"))
        }

        async fn get_child(&self, _child_id: &str) -> Result<Option<Child>> {
            Ok(None)
        }

        async fn list_children(&self) -> Result<Vec<Child>> {
            Ok(Vec::new())
        }
    }

    struct NoCredentials;

    #[async_trait]
    impl CredentialStorage for NoCredentials {
        async fn store_credential(&self, _credential: &QrCredential) -> Result<()> {
            Ok(())
        }

        async fn get_credential(&self, _child_id: &str) -> Result<Option<QrCredential>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_store_failure_propagates_and_session_survives() {
        let env = TestEnvironment::new().await.unwrap();
        let audit = Arc::new(CsvAuditLog::new(env.connection.clone()));
        let children: Arc<dyn ChildStorage> = Arc::new(FailingChildStore);
        let credentials = CredentialService::new(
            QrCredentialManager::new(Arc::new(SequenceTokenGenerator::new()), "eduwallet"),
            children.clone(),
            Arc::new(NoCredentials),
            audit.clone(),
        );
        let service = LinkingService::new(
            children,
            Arc::new(CsvRosterDirectory::new(env.connection.clone())),
            audit.clone(),
            credentials,
        );
        let actor = ActorContext::new("guardian_1", "web");

        let (session_id, _) = service.start_session();
        let mut events = create_events();
        events.extend(finish_events());
        let mut outcome = Ok(None);
        for event in events {
            outcome = service.apply_event(&session_id, event, &actor).await.map(Some);
            if outcome.is_err() {
                break;
            }
        }

        let err = outcome.unwrap_err();
        assert!(err.to_string().contains("store unavailable"));
        assert!(audit.recent_events(None).await.unwrap().is_empty());

        // Still on Review, so the guardian can retry
        let session = service.get_session(&session_id).await.unwrap();
        assert_eq!(session.step(), WizardStep::Review);
    }

    /// Audit log whose first write fails
    struct FlakyAudit {
        inner: CsvAuditLog,
        failed: AtomicBool,
    }

    #[async_trait]
    impl AuditSink for FlakyAudit {
        async fn record(&self, event: &AuditEvent) -> Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(anyhow::anyhow!("audit log unavailable"));
            }
            self.inner.record(event).await
        }

        async fn recent_events(&self, limit: Option<u32>) -> Result<Vec<AuditEvent>> {
            self.inner.recent_events(limit).await
        }
    }

    /// Credential store whose first write fails
    struct FlakyCredentials {
        inner: CredentialRepository,
        failed: AtomicBool,
    }

    #[async_trait]
    impl CredentialStorage for FlakyCredentials {
        async fn store_credential(&self, credential: &QrCredential) -> Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(anyhow::anyhow!("credential store unavailable"));
            }
            self.inner.store_credential(credential).await
        }

        async fn get_credential(&self, child_id: &str) -> Result<Option<QrCredential>> {
            self.inner.get_credential(child_id).await
        }
    }

    fn build_service(
        env: &TestEnvironment,
        audit: Arc<dyn AuditSink>,
        credentials: Arc<dyn CredentialStorage>,
    ) -> (LinkingService, Arc<ChildRepository>) {
        let children = Arc::new(ChildRepository::new(env.connection.clone()));
        let credential_service = CredentialService::new(
            QrCredentialManager::new(Arc::new(SequenceTokenGenerator::new()), "eduwallet"),
            children.clone(),
            credentials,
            audit.clone(),
        );
        let service = LinkingService::new(
            children.clone(),
            Arc::new(CsvRosterDirectory::new(env.connection.clone())),
            audit,
            credential_service,
        );
        (service, children)
    }

    async fn drive_to_review(service: &LinkingService, session_id: &str, actor: &ActorContext) {
        let mut events = create_events();
        events.extend(vec![WizardEvent::Next, WizardEvent::SetConfirmGuardian(true)]);
        for event in events {
            service.apply_event(session_id, event, actor).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_retry_after_audit_failure_stores_one_child() {
        let env = TestEnvironment::new().await.unwrap();
        let audit = Arc::new(FlakyAudit {
            inner: CsvAuditLog::new(env.connection.clone()),
            failed: AtomicBool::new(false),
        });
        let (service, children) = build_service(
            &env,
            audit.clone(),
            Arc::new(CredentialRepository::new(env.connection.clone())),
        );
        let actor = ActorContext::new("guardian_1", "web");

        let (session_id, _) = service.start_session();
        drive_to_review(&service, &session_id, &actor).await;

        let err = service
            .apply_event(&session_id, WizardEvent::Next, &actor)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("audit log unavailable"));
        assert_eq!(
            service.get_session(&session_id).await.unwrap().step(),
            WizardStep::Review
        );

        let first_child = children.list_children().await.unwrap();
        assert_eq!(first_child.len(), 1);

        match service.apply_event(&session_id, WizardEvent::Next, &actor).await.unwrap() {
            EventResult::Completed(LinkingCompletion::Created { child, .. }) => {
                assert_eq!(child.id, first_child[0].id);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(children.list_children().await.unwrap().len(), 1);
        let events = audit.recent_events(None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::ChildCreated);
    }

    #[tokio::test]
    async fn test_auto_issue_failure_is_reported_and_retried() {
        let env = TestEnvironment::new().await.unwrap();
        let audit = Arc::new(CsvAuditLog::new(env.connection.clone()));
        let (service, children) = build_service(
            &env,
            audit.clone(),
            Arc::new(FlakyCredentials {
                inner: CredentialRepository::new(env.connection.clone()),
                failed: AtomicBool::new(false),
            }),
        );
        let service = service.with_auto_issue(AutoIssue {
            mode: QrMode::Dynamic,
            rotation_interval_minutes: Some(5),
        });
        let actor = ActorContext::new("guardian_1", "web");

        let (session_id, _) = service.start_session();
        drive_to_review(&service, &session_id, &actor).await;

        let err = service
            .apply_event(&session_id, WizardEvent::Next, &actor)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("credential store unavailable"));
        assert_eq!(
            service.get_session(&session_id).await.unwrap().step(),
            WizardStep::Review
        );
        assert_eq!(children.list_children().await.unwrap().len(), 1);

        match service.apply_event(&session_id, WizardEvent::Next, &actor).await.unwrap() {
            EventResult::Completed(LinkingCompletion::Created { child, credential }) => {
                let credential = credential.expect("credential issued on retry");
                assert_eq!(credential.credential.child_id, child.id);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(children.list_children().await.unwrap().len(), 1);
        let actions: Vec<AuditAction> = audit
            .recent_events(None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![AuditAction::CredentialIssued, AuditAction::ChildCreated]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_get_distinct_children() {
        let f = setup_test().await;
        let mut session_ids = Vec::new();
        for _ in 0..64 {
            let (session_id, _) = f.service.start_session();
            drive_to_review(&f.service, &session_id, &f.actor).await;
            session_ids.push(session_id);
        }

        let handles: Vec<_> = session_ids
            .into_iter()
            .map(|session_id| {
                let service = f.service.clone();
                let actor = f.actor.clone();
                tokio::spawn(async move { service.apply_event(&session_id, WizardEvent::Next, &actor).await })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                EventResult::Completed(LinkingCompletion::Created { child, .. }) => {
                    ids.insert(child.id);
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }

        assert_eq!(ids.len(), 64);
        assert_eq!(f.children.list_children().await.unwrap().len(), 64);
        assert_eq!(f.audit.recent_events(None).await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire_on_next_start() {
        let f = setup_test().await;
        let service = f.service.clone().with_session_timeout(Duration::ZERO);

        let (stale_id, _) = service.start_session();
        let (fresh_id, _) = service.start_session();

        let err = service.get_session(&stale_id).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LinkingError>(),
            Some(&LinkingError::SessionNotFound(stale_id.clone()))
        );
        assert!(service.get_session(&fresh_id).await.is_ok());

        // The default timeout keeps recent sessions
        let (first_id, _) = f.service.start_session();
        f.service.start_session();
        assert!(f.service.get_session(&first_id).await.is_ok());
    }
}
