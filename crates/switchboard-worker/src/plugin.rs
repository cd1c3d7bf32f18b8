//! Plugins ("cogs") and extensions.
//!
//! A [`Plugin`] declares its handlers explicitly through
//! [`Plugin::bindings`]; [`PluginRegistry::add_cog`] registers each one with
//! the event, command or route table and remembers which cog owns it, so
//! [`PluginRegistry::remove_cog`] can tear the whole bundle down again.
//!
//! Extensions are named setup functions kept in an [`ExtensionCatalog`].
//! Loading one runs its setup against the registry; every cog added during
//! that run belongs to the extension and goes away when it is unloaded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use switchboard_types::BridgeError;
use tracing::{info, warn};

use crate::commands::{CommandSpec, CommandTable};
use crate::events::EventTable;
use crate::handler::Handler;
use crate::routes::RouteTable;

/// The registry as shared between the Worker's dispatch path and handlers.
///
/// Locks are only held for table lookups and mutations, never across an
/// `.await`.
pub type SharedRegistry = Arc<RwLock<PluginRegistry>>;

// ─────────────────────────────────────────────────────────────────────────────
// Bindings & the Plugin trait
// ─────────────────────────────────────────────────────────────────────────────

pub enum BindingKind {
    Event { name: String },
    Command(CommandSpec),
    Route { pattern: String },
}

/// One handler a plugin wants registered.
pub struct Binding {
    pub handler_name: String,
    pub kind: BindingKind,
    pub handler: Handler,
}

impl Binding {
    pub fn event(handler_name: impl Into<String>, event: impl Into<String>, handler: Handler) -> Self {
        Self {
            handler_name: handler_name.into(),
            kind: BindingKind::Event { name: event.into() },
            handler,
        }
    }

    /// A command binding; the handler is named after the command.
    pub fn command(spec: CommandSpec, handler: Handler) -> Self {
        Self {
            handler_name: spec.name.clone(),
            kind: BindingKind::Command(spec),
            handler,
        }
    }

    pub fn route(handler_name: impl Into<String>, pattern: impl Into<String>, handler: Handler) -> Self {
        Self {
            handler_name: handler_name.into(),
            kind: BindingKind::Route { pattern: pattern.into() },
            handler,
        }
    }
}

/// A bundle of event, command and route handlers registered as one unit.
pub trait Plugin: Send + Sync {
    /// Unique cog name.
    fn name(&self) -> &str;

    fn bindings(&self) -> Vec<Binding>;

    /// Called exactly once, when the cog is removed.
    fn on_unload(&self) {}
}

struct CogRecord {
    plugin: Box<dyn Plugin>,
    handler_names: Vec<String>,
    extension: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Extensions
// ─────────────────────────────────────────────────────────────────────────────

pub type ExtensionSetup = Arc<dyn Fn(&mut PluginRegistry) -> Result<(), BridgeError> + Send + Sync>;

/// Extensions available for loading, by name.
#[derive(Default, Clone)]
pub struct ExtensionCatalog {
    entries: BTreeMap<String, ExtensionSetup>,
}

impl ExtensionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension (builder-style).
    pub fn with<F>(mut self, name: impl Into<String>, setup: F) -> Self
    where
        F: Fn(&mut PluginRegistry) -> Result<(), BridgeError> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(setup));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PluginRegistry {
    events: EventTable,
    commands: CommandTable,
    routes: RouteTable,
    cogs: BTreeMap<String, CogRecord>,
    catalog: ExtensionCatalog,
    extensions: BTreeSet<String>,
    loading: Option<String>,
}

impl PluginRegistry {
    pub fn new(catalog: ExtensionCatalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    /// Wrap into the shared form used by the Worker.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn events(&self) -> &EventTable {
        &self.events
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn catalog(&self) -> &ExtensionCatalog {
        &self.catalog
    }

    pub fn cog_names(&self) -> Vec<&str> {
        self.cogs.keys().map(String::as_str).collect()
    }

    pub fn has_cog(&self, name: &str) -> bool {
        self.cogs.contains_key(name)
    }

    /// Handler names a cog registered, in declaration order.
    pub fn cog_handlers(&self, name: &str) -> Option<&[String]> {
        self.cogs.get(name).map(|c| c.handler_names.as_slice())
    }

    pub fn loaded_extensions(&self) -> Vec<&str> {
        self.extensions.iter().map(String::as_str).collect()
    }

    // ── Cogs ─────────────────────────────────────────────────────────────────

    /// Register every binding of `plugin`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DuplicatePlugin`] if a cog with the same name is loaded.
    pub fn add_cog<P: Plugin + 'static>(&mut self, plugin: P) -> Result<(), BridgeError> {
        let name = plugin.name().to_string();
        if self.cogs.contains_key(&name) {
            return Err(BridgeError::DuplicatePlugin(name));
        }
        let mut handler_names = Vec::new();
        for binding in plugin.bindings() {
            let owner = Some(name.as_str());
            match binding.kind {
                BindingKind::Event { name: event } => {
                    self.events.add(&event, &binding.handler_name, owner, binding.handler);
                }
                BindingKind::Command(spec) => {
                    self.commands.add(spec, &binding.handler_name, owner, binding.handler);
                }
                BindingKind::Route { pattern } => {
                    self.routes.add(&pattern, &binding.handler_name, owner, binding.handler);
                }
            }
            handler_names.push(binding.handler_name);
        }
        info!(cog = %name, handlers = handler_names.len(), "added cog");
        self.cogs.insert(
            name,
            CogRecord {
                plugin: Box::new(plugin),
                handler_names,
                extension: self.loading.clone(),
            },
        );
        Ok(())
    }

    /// Unregister every binding of the cog and run its unload hook.
    ///
    /// # Errors
    ///
    /// [`BridgeError::PluginNotFound`] for an unknown name.
    pub fn remove_cog(&mut self, name: &str) -> Result<(), BridgeError> {
        let record = self
            .cogs
            .remove(name)
            .ok_or_else(|| BridgeError::PluginNotFound(name.to_string()))?;
        let removed = self.events.remove_owned(name)
            + self.commands.remove_owned(name)
            + self.routes.remove_owned(name);
        record.plugin.on_unload();
        info!(cog = name, removed, "removed cog");
        Ok(())
    }

    // ── Free-standing bindings ───────────────────────────────────────────────

    pub fn add_event(&mut self, event: &str, handler_name: &str, handler: Handler) {
        self.events.add(event, handler_name, None, handler);
    }

    pub fn remove_event(&mut self, event: &str, handler_name: &str) -> Result<(), BridgeError> {
        self.events.remove(event, handler_name)
    }

    pub fn add_command(&mut self, spec: CommandSpec, handler: Handler) {
        let handler_name = spec.name.clone();
        self.commands.add(spec, &handler_name, None, handler);
    }

    pub fn remove_command(&mut self, name: &str) -> Result<(), BridgeError> {
        self.commands.remove(name)
    }

    pub fn add_route(&mut self, pattern: &str, handler_name: &str, handler: Handler) {
        self.routes.add(pattern, handler_name, None, handler);
    }

    pub fn remove_route(&mut self, pattern: &str) -> Result<(), BridgeError> {
        self.routes.remove(pattern)
    }

    // ── Extensions ───────────────────────────────────────────────────────────

    /// Run the named extension's setup.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::ExtensionNotFound`] – not in the catalog.
    /// * [`BridgeError::DuplicatePlugin`] – already loaded.
    /// * whatever the setup returns; cogs it added before failing are removed.
    pub fn load_extension(&mut self, name: &str) -> Result<(), BridgeError> {
        let setup = self
            .catalog
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::ExtensionNotFound(name.to_string()))?;
        if self.extensions.contains(name) {
            return Err(BridgeError::DuplicatePlugin(format!("extension {name}")));
        }

        self.loading = Some(name.to_string());
        let result = setup(self);
        self.loading = None;

        if let Err(e) = result {
            warn!(extension = name, error = %e, "extension setup failed");
            self.remove_extension_cogs(name);
            return Err(e);
        }
        self.extensions.insert(name.to_string());
        info!(extension = name, "loaded extension");
        Ok(())
    }

    /// Remove every cog the extension added.
    pub fn unload_extension(&mut self, name: &str) -> Result<(), BridgeError> {
        if !self.extensions.remove(name) {
            return Err(BridgeError::ExtensionNotFound(name.to_string()));
        }
        self.remove_extension_cogs(name);
        info!(extension = name, "unloaded extension");
        Ok(())
    }

    pub fn reload_extension(&mut self, name: &str) -> Result<(), BridgeError> {
        self.unload_extension(name)?;
        self.load_extension(name)?;
        info!(extension = name, "reloaded extension");
        Ok(())
    }

    /// Reload every loaded extension, stopping at the first failure.
    pub fn reload_all_extensions(&mut self) -> Result<(), BridgeError> {
        let names: Vec<String> = self.extensions.iter().cloned().collect();
        for name in names {
            self.reload_extension(&name)?;
        }
        info!("reloaded all extensions");
        Ok(())
    }

    fn remove_extension_cogs(&mut self, extension: &str) {
        let owned: Vec<String> = self
            .cogs
            .iter()
            .filter(|(_, c)| c.extension.as_deref() == Some(extension))
            .map(|(n, _)| n.clone())
            .collect();
        for cog in owned {
            // Cannot fail: the name was just read from the map.
            let _ = self.remove_cog(&cog);
        }
    }
}
