//! SiteScope plugin contract.
//!
//! Every analyzer the engine can run implements [`Plugin`]: a named,
//! independently timeboxed unit of work that turns a typed [`PluginInput`]
//! into a [`PluginOutput`] or a classified [`PluginError`]. Plugins are
//! collected into a [`PluginRegistry`] at startup.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod context;
pub mod error;
pub mod plugin;
pub mod registry;

pub use context::{PluginContext, PluginReport, Reporter};
pub use error::{classify_message, ErrorClass, PluginError, RegistryError};
pub use plugin::{names, PhaseInput, Plugin, PluginInput, PluginOutput};
pub use registry::{PluginRegistry, PluginRegistryBuilder};
