//! edgellm - privacy-aware on-device LLM runtime
//!
//! This library detects what a device can run, downloads and verifies model
//! artifacts, streams local inference and decides per request whether a query may be
//! handed to an external model. Every routing decision lands in an append-only audit
//! log.
//!
//! # Core Concepts
//!
//! - **Capabilities**: Hardware snapshot classified into a performance tier with
//!   derived inference constraints
//! - **Catalog**: Model descriptors filtered by tier and memory
//! - **Downloads**: Resumable, checksum-verified artifact transfer
//! - **Routing**: Privacy policy, consent and intent decide local, external or denied
//! - **Audit**: JSON-lines record of queries, responses, model loads and policy changes
//!
//! # Example Usage
//!
//! ```no_run
//! use edgellm::inference::InferenceRequest;
//! use edgellm::{Runtime, RuntimeConfig};
//!
//! # async fn run() -> edgellm::Result<()> {
//! let runtime = Runtime::open(RuntimeConfig::default())?;
//! let progress = runtime.start_download("tinyllama-1.1b-q4")?;
//! let state = progress.wait().await;
//! println!("download {}", state.status);
//!
//! let request = InferenceRequest::new("tinyllama-1.1b-q4", "What is the capital of France?");
//! let outcome = runtime
//!     .infer(request, |token| print!("{}", token.token))
//!     .await?;
//! println!("\nrouted to {:?}", outcome.decision.target);
//! # Ok(())
//! # }
//! ```
//!
//! # Project Structure
//!
//! - [`capability`]: Host probes, tiering and constraints
//! - [`catalog`]: Model descriptors and compatibility
//! - [`download`]: Artifact transfer, verification and the local model store
//! - [`inference`]: Execution contract, model registry and sessions
//! - [`routing`]: Privacy policy, consent, intent and the routing controller
//! - [`audit`]: Append-only audit log
//! - [`runtime`]: Facade wiring everything together
//! - [`ipc`]: JSON-RPC 2.0 over stdio
//! - [`cli`]: Command-line interface

pub mod audit;
pub mod capability;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod inference;
pub mod ipc;
pub mod routing;
pub mod runtime;
pub mod util;

pub use config::{ConfigError, RuntimeConfig, RuntimeLayout};
pub use context::RuntimeContext;
pub use error::{ErrorKind, Result, RuntimeError};
pub use runtime::{Dispatch, RunOutcome, Runtime, RuntimeBuilder};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
