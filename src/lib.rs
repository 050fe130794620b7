//! # Binix Isolation - Process-isolation security policy
//!
//! Decides what each sandboxed renderer process of the Binix browser may
//! request, commit and read, and which process a URL belongs in.
//!
//! ## Architecture
//!
//! - **policy**: The [`SecurityPolicy`] facade, access decisions and site computation
//! - **process**: Per-process security state, process locks and handles
//! - **isolation**: Browsing groups, isolated origins and origin-agent-cluster tracking
//! - **origin**: Origins, sites and URL helpers
//! - **config**: Process model and cleanup settings
//! - **embedder**: Hooks the embedding browser implements
//! - **scheduler**: Delayed cleanup tasks and execution contexts
//! - **utils**: Shared error types

pub mod config;
pub mod embedder;
pub mod isolation;
pub mod origin;
pub mod policy;
pub mod process;
pub mod scheduler;
pub mod utils;

// Re-export main types for convenience
pub use config::PolicyConfig;
pub use isolation::{BrowserContextId, BrowsingGroupId, IsolatedOriginSource, IsolationContext, OacIsolationState, UrlInfo};
pub use origin::Origin;
pub use policy::{CanCommitStatus, SecurityPolicy, SecurityPolicyBuilder, SiteInfo};
pub use process::{Handle, ProcessId, ProcessLock};
pub use utils::error::{ContractViolation, PolicyError, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "Binix Isolation";
