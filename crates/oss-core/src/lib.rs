pub mod blob;
pub mod canonical;
pub mod config;
pub mod crypto;
pub mod db;
pub mod fingerprint;
pub mod jobs;
pub mod mailboxes;
pub mod mime;
pub mod occurrences;
pub mod orgs;
pub mod provider;
pub mod queue;
pub mod routing;
pub mod sync;
pub mod telemetry;
pub mod tickets;
pub mod worker;

pub use blob::{BlobError, BlobStore, FsBlobStore, S3BlobStore};
pub use canonical::{
    Attachment, CanonicalError, CanonicalMessage, CanonicalRepository, CollisionGroupSummary,
    Direction, NewAttachment, NewCanonicalMessage, UpsertOutcome,
};
pub use config::{Config, ConfigError};
pub use crypto::{CredentialCrypto, CryptoError, MailboxCredentials};
pub use db::{Database, DbError, run_migrations};
pub use jobs::{
    JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC, JOB_TYPE_OCCURRENCE_FETCH_RAW,
    JOB_TYPE_OCCURRENCE_PARSE, JOB_TYPE_OCCURRENCE_STITCH, JOB_TYPE_TICKET_APPLY_ROUTING,
    JobDispatcher,
};
pub use mailboxes::{
    BreakerConfig, Mailbox, MailboxError, MailboxRepository, MailboxSyncStatus, PURPOSE_JOURNAL,
    SyncEvent, SyncKind,
};
pub use mime::{
    EmailAddress, ParsedEmail, RecipientConfidence, RecipientEvidence, RecipientSource, Sanitizer,
};
pub use occurrences::{
    Occurrence, OccurrenceError, OccurrenceRepository, OccurrenceState, Stage,
};
pub use orgs::{OrgError, OrgRepository, Organization, Queue, User};
pub use provider::{
    FakeProvider, GmailProvider, HistoryDelta, HistoryEvent, HistoryEventKind, MessagePage,
    Profile, Provider, ProviderError,
};
pub use queue::{EnqueueOptions, Job, JobCount, JobQueue, JobStatus, QueueError};
pub use routing::{
    AllowlistEntry, NewRoutingRule, RoutingDecision, RoutingInput, RoutingRepository, RoutingRule,
    simulate,
};
pub use sync::{SyncControlError, SyncController, SyncSummary};
pub use telemetry::{TelemetryError, init_telemetry};
pub use tickets::{
    NewTicket, StitchConfidence, StitchReason, Ticket, TicketError, TicketRepository, TicketStatus,
};
pub use worker::{
    JobError, JobExecutor, PoolConfig, WorkerHostConfig, run_worker_host,
};
