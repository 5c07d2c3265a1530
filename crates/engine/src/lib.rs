//! # Strata Engine
//!
//! The Strata engine turns a declarative infrastructure template into cloud
//! resources. A template declares resources, parameters and outputs; the
//! engine works out the order in which resources have to exist, provisions
//! them concurrently where the dependency graph allows, and records what it
//! built so the next run only changes what changed.
//!
//! ## Key Features
//!
//! - **Template Parsing**: YAML or JSON documents, including short-form intrinsic tags
//! - **Reference Resolution**: `Ref`, `Fn::GetAtt`, `Fn::Sub`, `Fn::Join` and friends become typed expressions
//! - **Dependency Scheduling**: deterministic topological order with cycle detection
//! - **Concurrent Provisioning**: bounded parallelism, retries with backoff, failure isolation
//! - **Persistent State**: idempotent re-apply, destroy, rollback and cross-stack exports
//!
//! ## Usage
//!
//! ```rust
//! use strata_engine::{ResolveInputs, parse_template_file, plan_apply, resolve_template};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let template_path = temp_dir.path().join("network.yaml");
//! std::fs::write(&template_path, r#"
//! Resources:
//!   VPC:
//!     Type: AWS::EC2::VPC
//!     Properties:
//!       CidrBlock: 10.0.0.0/16
//!   Subnet:
//!     Type: AWS::EC2::Subnet
//!     Properties:
//!       VpcId: !Ref VPC
//! "#)?;
//!
//! let template = parse_template_file(&template_path)?;
//! let resolved = resolve_template(&template, &ResolveInputs::new("network"))?;
//! let plan = plan_apply(&resolved, None, true)?;
//! assert_eq!(plan.changes.len(), 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`parser`**: document text to [`ParsedTemplate`]
//! - **`resolve`**: parameters and intrinsic functions to a [`DependencyGraph`]
//! - **`scheduler`**: creation and deletion orders, incremental work queues
//! - **`executor`**: drives provider calls and persists each result
//! - **`provider`**: the [`CloudProvider`] seam and an in-memory implementation
//! - **`state`**: persisted stack state and its backends

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod model;
pub mod outputs;
pub mod parameters;
pub mod parser;
pub mod provider;
pub mod resolve;
pub mod scheduler;
pub mod state;

pub use config::{EngineConfig, default_config_path, load_config, load_config_from_path};
pub use error::{EngineError, EngineResult, TemplateError};
pub use executor::{ApplyOptions, ApplyReport, Executor, Plan, PlannedChange, ResourceOutcome, RetryPolicy, plan_apply, plan_destroy};
pub use graph::{DependencyGraph, GraphNode};
pub use model::{ParsedTemplate, ResourceNode};
pub use parser::parse_template;
pub use provider::{CloudProvider, ProviderError, ProviderErrorKind, ProvisionedResource, SimulatedProvider};
pub use resolve::{ResolveInputs, ResolvedTemplate, resolve_template};
pub use scheduler::{WorkQueue, creation_order, deletion_order};
pub use state::{InMemoryStateStore, JsonStateStore, StackState, StateStore};

/// Reads and parses a template file.
///
/// The document format is detected from its content; `.json` and `.yaml`
/// files are handled alike.
pub fn parse_template_file(file_path: impl AsRef<Path>) -> Result<ParsedTemplate> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read template file: {}", file_path.display()))?;
    let template = parse_template(&content).with_context(|| format!("Invalid template: {}", file_path.display()))?;
    Ok(template)
}
