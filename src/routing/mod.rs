//! Privacy-aware routing of inference requests

mod consent;
mod controller;
mod external;
mod intent;
mod policy;

pub use consent::{
    prompt_digest, ConsentRecord, ConsentScope, ConsentStore, FileConsentStore,
    DEFAULT_CONSENT_DAYS,
};
pub use controller::{CapabilityMatch, RouteTarget, RoutingController, RoutingDecision};
pub use external::{CannedExternalModel, ExternalModel, OpenAiCompatibleModel};
pub use intent::{Intent, IntentKind, IntentResolver, LocalIntentResolver, PatternIntentResolver};
pub use policy::{PolicyStore, PolicyUpdate, PrivacyPolicy, MAX_RETENTION_DAYS, MIN_RETENTION_DAYS};
