// Cadence core
// State persistence, secure input vault, graph resolution, and run-plan
// evaluation shared by the runtime and the HTTP server.

pub mod clock;
pub mod config;
pub mod cron;
pub mod encryptor;
pub mod error;
pub mod preflight;
pub mod resolver;
pub mod store;
pub mod vault;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EnvConfig;
pub use encryptor::{AesGcmEncryptor, EncryptedEntry, Encryptor};
pub use error::{CadenceError, Result};
pub use preflight::{Check, CheckStatus, CredentialHealth, PreflightContext, SmartRunPlan};
pub use resolver::resolution_order;
pub use store::{JsonStateStore, RunMutator, StateStore, RUN_RETENTION_LIMIT};
pub use vault::SecureInputVault;
