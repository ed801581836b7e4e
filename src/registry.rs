//! Replay-side contexts, drawables and trace-handle maps
//!
//! Traces refer to contexts and surfaces by the opaque handle values the
//! recording application saw. Each API family keeps [`HandleMap`]s from
//! those handles to objects owned by [`Resources`], which wraps the window
//! system's objects with the per-context state replay needs to track.
//!
//! Objects are reference counted by the handle maps that point at them. An
//! object whose last reference goes away while it is bound is orphaned and
//! destroyed once the binding moves elsewhere.

use crate::error::Result;
use crate::ws::{ContextId, DrawableId, Profile, WindowSystem};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Replay-side state of one context
#[derive(Debug, Clone, Serialize)]
pub struct ContextState {
    pub id: ContextId,
    pub profile: Profile,
    /// Drawable last bound with this context
    pub drawable: Option<DrawableId>,
    /// Set once the context has been made current with a drawable
    pub used: bool,
    pub active_program: u32,
    pub program: u32,
    pub program_pipeline: u32,
    pub pipeline_programs: HashMap<u32, u32>,
    pub array_buffer: u32,
    pub element_array_buffer: u32,
    pub pixel_pack_buffer: u32,
    pub inside_list: bool,
    pub inside_begin_end: bool,
    #[serde(skip)]
    refs: u32,
}

impl ContextState {
    fn new(id: ContextId, profile: Profile) -> Self {
        Self {
            id,
            profile,
            drawable: None,
            used: false,
            active_program: 0,
            program: 0,
            program_pipeline: 0,
            pipeline_programs: HashMap::new(),
            array_buffer: 0,
            element_array_buffer: 0,
            pixel_pack_buffer: 0,
            inside_list: false,
            inside_begin_end: false,
            refs: 1,
        }
    }
}

/// Replay-side state of one drawable
#[derive(Debug, Clone, Serialize)]
pub struct DrawableState {
    pub id: DrawableId,
    pub profile: Profile,
    pub width: u32,
    pub height: u32,
    /// Size has been inferred from the call stream
    pub visible: bool,
    pub pbuffer: bool,
    #[serde(skip)]
    refs: u32,
}

/// Owner of every live context and drawable
#[derive(Debug, Default)]
pub struct Resources {
    contexts: BTreeMap<ContextId, ContextState>,
    drawables: BTreeMap<DrawableId, DrawableState>,
    current: Option<ContextId>,
    current_drawable: Option<DrawableId>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_context(
        &mut self,
        ws: &mut dyn WindowSystem,
        share: Option<ContextId>,
        profile: Profile,
    ) -> Option<ContextId> {
        let id = ws.create_context(profile, share)?;
        self.contexts.insert(id, ContextState::new(id, profile));
        tracing::debug!(context = id.0, %profile, "context created");
        Some(id)
    }

    pub fn create_drawable(&mut self, ws: &mut dyn WindowSystem, profile: Profile) -> Result<DrawableId> {
        self.insert_drawable(ws, profile, None)
    }

    pub fn create_pbuffer(
        &mut self,
        ws: &mut dyn WindowSystem,
        profile: Profile,
        width: u32,
        height: u32,
    ) -> Result<DrawableId> {
        self.insert_drawable(ws, profile, Some((width, height)))
    }

    fn insert_drawable(
        &mut self,
        ws: &mut dyn WindowSystem,
        profile: Profile,
        pbuffer: Option<(u32, u32)>,
    ) -> Result<DrawableId> {
        let id = ws.create_drawable(profile, pbuffer)?;
        let (width, height) = pbuffer.unwrap_or((0, 0));
        self.drawables.insert(
            id,
            DrawableState {
                id,
                profile,
                width,
                height,
                visible: pbuffer.is_some(),
                pbuffer: pbuffer.is_some(),
                refs: 1,
            },
        );
        tracing::debug!(drawable = id.0, pbuffer = pbuffer.is_some(), "drawable created");
        Ok(id)
    }

    pub fn retain_context(&mut self, id: ContextId) {
        if let Some(ctx) = self.contexts.get_mut(&id) {
            ctx.refs += 1;
        }
    }

    pub fn retain_drawable(&mut self, id: DrawableId) {
        if let Some(d) = self.drawables.get_mut(&id) {
            d.refs += 1;
        }
    }

    /// Drop one reference; destroys the context unless it is current
    pub fn release_context(&mut self, ws: &mut dyn WindowSystem, id: ContextId) {
        let Some(ctx) = self.contexts.get_mut(&id) else {
            return;
        };
        ctx.refs = ctx.refs.saturating_sub(1);
        if ctx.refs == 0 && self.current != Some(id) {
            self.contexts.remove(&id);
            ws.destroy_context(id);
            tracing::debug!(context = id.0, "context destroyed");
        }
    }

    /// Drop one reference; destroys the drawable unless it is bound
    pub fn release_drawable(&mut self, ws: &mut dyn WindowSystem, id: DrawableId) {
        let Some(d) = self.drawables.get_mut(&id) else {
            return;
        };
        d.refs = d.refs.saturating_sub(1);
        if d.refs == 0 && self.current_drawable != Some(id) {
            self.destroy_drawable(ws, id);
        }
    }

    fn destroy_drawable(&mut self, ws: &mut dyn WindowSystem, id: DrawableId) {
        self.drawables.remove(&id);
        for ctx in self.contexts.values_mut() {
            if ctx.drawable == Some(id) {
                ctx.drawable = None;
            }
        }
        ws.destroy_drawable(id);
        tracing::debug!(drawable = id.0, "drawable destroyed");
    }

    /// Bind `drawable` and `context` through the window system
    ///
    /// Objects released while they were bound are destroyed here once they
    /// are no longer part of the binding.
    pub fn bind(
        &mut self,
        ws: &mut dyn WindowSystem,
        drawable: Option<DrawableId>,
        context: Option<ContextId>,
    ) -> bool {
        if !ws.make_current(drawable, context) {
            return false;
        }

        let previous = (self.current, self.current_drawable);
        self.current = context;
        self.current_drawable = context.and(drawable);
        if let (Some(c), Some(d)) = (context, drawable) {
            if let Some(ctx) = self.contexts.get_mut(&c) {
                ctx.drawable = Some(d);
            }
        }

        if let Some(old) = previous.0.filter(|c| Some(*c) != context) {
            if self.contexts.get(&old).is_some_and(|c| c.refs == 0) {
                self.contexts.remove(&old);
                ws.destroy_context(old);
                tracing::debug!(context = old.0, "deferred context destroy");
            }
        }
        if let Some(old) = previous.1.filter(|d| Some(*d) != self.current_drawable) {
            if self.drawables.get(&old).is_some_and(|d| d.refs == 0) {
                self.destroy_drawable(ws, old);
                tracing::debug!(drawable = old.0, "deferred drawable destroy");
            }
        }
        true
    }

    pub fn current_context_id(&self) -> Option<ContextId> {
        self.current
    }

    pub fn current_context(&self) -> Option<&ContextState> {
        self.current.and_then(|id| self.contexts.get(&id))
    }

    pub fn current_context_mut(&mut self) -> Option<&mut ContextState> {
        self.current.and_then(|id| self.contexts.get_mut(&id))
    }

    /// Drawable bound with the current context
    pub fn current_drawable(&self) -> Option<&DrawableState> {
        self.current_drawable.and_then(|id| self.drawables.get(&id))
    }

    pub fn current_drawable_mut(&mut self) -> Option<&mut DrawableState> {
        self.current_drawable.and_then(|id| self.drawables.get_mut(&id))
    }

    pub fn context(&self, id: ContextId) -> Option<&ContextState> {
        self.contexts.get(&id)
    }

    pub fn drawable(&self, id: DrawableId) -> Option<&DrawableState> {
        self.drawables.get(&id)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn drawable_count(&self) -> usize {
        self.drawables.len()
    }

    /// Unbind and destroy everything
    pub fn clear(&mut self, ws: &mut dyn WindowSystem) {
        if self.current.is_some() {
            ws.make_current(None, None);
        }
        self.current = None;
        self.current_drawable = None;
        for id in std::mem::take(&mut self.contexts).into_keys() {
            ws.destroy_context(id);
        }
        for id in std::mem::take(&mut self.drawables).into_keys() {
            ws.destroy_drawable(id);
        }
    }
}

/// Trace handle to replay object map for one API family
#[derive(Debug, Clone)]
pub struct HandleMap<T> {
    map: HashMap<u64, T>,
}

impl<T: Copy + PartialEq> HandleMap<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn get(&self, handle: u64) -> Option<T> {
        self.map.get(&handle).copied()
    }

    /// Map `handle` to `value`, returning the object it used to map to
    pub fn insert(&mut self, handle: u64, value: T) -> Option<T> {
        self.map.insert(handle, value).filter(|old| *old != value)
    }

    pub fn remove(&mut self, handle: u64) -> Option<T> {
        self.map.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<T: Copy + PartialEq> Default for HandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
