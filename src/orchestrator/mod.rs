//! Task lifecycle orchestration.
//!
//! Components, leaves first: deduplication and definition binding on
//! ingest, claim-guarded notification dispatch, guest progress notices,
//! triage routing, reply ingestion, completion notices and archival. [`Engine`] wires them to
//! one shared [`Context`].

pub mod archiver;
pub mod completion;
pub mod dedup;
pub mod definition_match;
pub mod dispatcher;
pub mod guest_notice;
pub mod pass;
pub mod reply;
pub mod task_manager;
pub mod triage;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GlobalConfig;
use crate::notifier::Notifier;
use crate::oracle::DecisionOracle;
use crate::persistence::archive_repo::ArchiveRepo;
use crate::persistence::audit_repo::AuditRepo;
use crate::persistence::db::Database;
use crate::persistence::definition_repo::DefinitionRepo;
use crate::persistence::event_repo::EventRepo;
use crate::persistence::message_repo::MessageRepo;
use crate::persistence::property_repo::PropertyRepo;
use crate::persistence::task_repo::TaskRepo;
use crate::policy::denylist::CategoryDenylist;
use crate::policy::language::ReplyLanguage;
use crate::{AppError, Result};

use self::archiver::Archiver;
use self::completion::CompletionCoordinator;
use self::dedup::Deduplicator;
use self::dispatcher::NotificationDispatcher;
use self::guest_notice::GuestNotices;
use self::reply::ReplyIngestor;
use self::task_manager::TaskManager;
use self::triage::TriageRouter;

/// Escalation reason recorded when automation gives up on a task.
pub const SYSTEM_ESCALATION_REASON: &str = "automation failed to reach staff/host";

/// Escalation reason recorded when staff say they cannot help.
pub const STAFF_INABILITY_REASON: &str = "staff reported they cannot fulfil the request";

/// Stores, collaborators and compiled policy shared by every component.
pub struct Context {
    /// Validated configuration.
    pub config: Arc<GlobalConfig>,
    /// Shared pool.
    pub db: Arc<Database>,
    /// Task records.
    pub tasks: TaskRepo,
    /// Conversation messages.
    pub messages: MessageRepo,
    /// Audit trail.
    pub audit: AuditRepo,
    /// Task definitions.
    pub definitions: DefinitionRepo,
    /// Consumed classification events.
    pub events: EventRepo,
    /// Property host contacts.
    pub properties: PropertyRepo,
    /// Cold storage.
    pub archive: ArchiveRepo,
    /// Decision oracle.
    pub oracle: Arc<dyn DecisionOracle>,
    /// Outbound transport.
    pub notifier: Arc<dyn Notifier>,
    /// Category noise filter.
    pub denylist: CategoryDenylist,
    /// Reply vocabularies.
    pub language: ReplyLanguage,
}

impl Context {
    /// Build the shared context.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the reply vocabularies do not compile.
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        oracle: Arc<dyn DecisionOracle>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        Ok(Self {
            tasks: TaskRepo::new(Arc::clone(&db)),
            messages: MessageRepo::new(Arc::clone(&db)),
            audit: AuditRepo::new(Arc::clone(&db)),
            definitions: DefinitionRepo::new(Arc::clone(&db)),
            events: EventRepo::new(Arc::clone(&db)),
            properties: PropertyRepo::new(Arc::clone(&db)),
            archive: ArchiveRepo::new(Arc::clone(&db)),
            denylist: CategoryDenylist::from_config(&config.categories),
            language: ReplyLanguage::from_config(&config.language)?,
            config,
            db,
            oracle,
            notifier,
        })
    }

    /// Attempt cap before escalation.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.config.orchestration.max_attempts
    }

    /// Host contact for a property, falling back to the configured default.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the lookup fails.
    pub async fn host_address(&self, property_id: &str) -> Result<Option<String>> {
        if let Some(address) = self.properties.host_address(property_id).await? {
            return Ok(Some(address));
        }
        Ok(self
            .config
            .routing
            .default_host_address
            .clone()
            .filter(|address| !address.trim().is_empty()))
    }
}

/// Run a collaborator call under a time budget.
///
/// # Errors
///
/// Returns `AppError::Timeout` if the budget elapses, or the call's own error.
pub async fn bounded<T, F>(budget: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(budget, call)
        .await
        .map_err(|_| AppError::Timeout(format!("{what} exceeded {}s", budget.as_secs())))?
}

/// All lifecycle components over one shared context.
#[derive(Clone)]
pub struct Engine {
    /// Shared stores and collaborators.
    pub ctx: Arc<Context>,
    /// Classification event intake.
    pub dedup: Deduplicator,
    /// Routing decisions.
    pub triage: TriageRouter,
    /// Claim-guarded delivery.
    pub dispatcher: NotificationDispatcher,
    /// Owed guest updates and info requests.
    pub guest_notices: GuestNotices,
    /// Reply intake.
    pub replies: ReplyIngestor,
    /// Guest completion notices.
    pub completion: CompletionCoordinator,
    /// Cold storage and retention.
    pub archiver: Archiver,
    /// Operator task API.
    pub tasks: TaskManager,
}

impl Engine {
    /// Wire every component to one context.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the reply vocabularies do not compile.
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        oracle: Arc<dyn DecisionOracle>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let ctx = Arc::new(Context::new(config, db, oracle, notifier)?);
        let dispatcher = NotificationDispatcher::new(Arc::clone(&ctx));
        let guest_notices = GuestNotices::new(Arc::clone(&ctx), dispatcher.clone());
        let triage =
            TriageRouter::new(Arc::clone(&ctx), dispatcher.clone(), guest_notices.clone());
        Ok(Self {
            dedup: Deduplicator::new(Arc::clone(&ctx)),
            replies: ReplyIngestor::new(Arc::clone(&ctx), guest_notices.clone()),
            completion: CompletionCoordinator::new(Arc::clone(&ctx), dispatcher.clone()),
            archiver: Archiver::new(Arc::clone(&ctx)),
            tasks: TaskManager::new(Arc::clone(&ctx), triage.clone()),
            triage,
            dispatcher,
            guest_notices,
            ctx,
        })
    }
}
