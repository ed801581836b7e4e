//! Call dispatch by function name
//!
//! A [`Player`] maps recorded function names to replay callbacks. API
//! families contribute tables of [`Entry`]s; a family may also register a
//! [`Fallback`] that claims every other name it recognises. Calls nobody
//! claims are reported once per name and otherwise skipped.

use crate::call::Call;
use crate::error::Result;
use crate::state::ReplayState;
use std::collections::{HashMap, HashSet};

/// Replay handler for one recorded call
pub type Callback = fn(&mut ReplayState, &Call) -> Result<()>;

/// Name to handler binding in a family table
#[derive(Clone, Copy)]
pub struct Entry {
    pub name: &'static str,
    pub callback: Callback,
}

/// Catch-all handler for names a family recognises by shape
#[derive(Clone, Copy)]
pub struct Fallback {
    pub matches: fn(&str) -> bool,
    pub callback: Callback,
}

/// Handler for calls that need no replay
pub fn ignore(_state: &mut ReplayState, _call: &Call) -> Result<()> {
    Ok(())
}

#[derive(Default)]
pub struct Player {
    callbacks: HashMap<&'static str, Callback>,
    fallbacks: Vec<Fallback>,
    unsupported: HashSet<String>,
}

impl Player {
    pub fn new() -> Self {
        Self::default()
    }

    /// Player with every built-in API family registered
    pub fn with_all_apis() -> Self {
        let mut player = Self::new();
        crate::apis::register_all(&mut player);
        player
    }

    /// Register a family table; later entries override earlier ones
    pub fn add_callbacks(&mut self, entries: &[Entry]) {
        for entry in entries {
            self.callbacks.insert(entry.name, entry.callback);
        }
    }

    pub fn add_fallback(&mut self, fallback: Fallback) {
        self.fallbacks.push(fallback);
    }

    pub fn lookup(&self, name: &str) -> Option<Callback> {
        self.callbacks.get(name).copied().or_else(|| {
            self.fallbacks
                .iter()
                .find(|f| (f.matches)(name))
                .map(|f| f.callback)
        })
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Names seen without a handler
    pub fn unsupported(&self) -> impl Iterator<Item = &str> {
        self.unsupported.iter().map(String::as_str)
    }

    /// Replay one call
    pub fn play(&mut self, state: &mut ReplayState, call: &Call) -> Result<()> {
        match self.lookup(call.name()) {
            Some(callback) => callback(state, call),
            None => {
                if self.unsupported.insert(call.name().to_string()) {
                    state.warning(call, format!("unsupported {} call", call.name()));
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("callbacks", &self.callbacks.len())
            .field("fallbacks", &self.fallbacks.len())
            .field("unsupported", &self.unsupported)
            .finish()
    }
}
