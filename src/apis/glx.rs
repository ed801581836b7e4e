//! GLX entry points
//!
//! GLX traces may reference drawables and contexts the replay never saw
//! being created (windows come from Xlib, contexts from before tracing
//! started). Both are created on first use.

use super::{context_profile, parse_attrib, present};
use crate::call::Call;
use crate::error::Result;
use crate::player::{ignore, Entry};
use crate::registry::HandleMap;
use crate::state::ReplayState;
use crate::ws::{ContextId, DrawableId, Profile};

const GLX_PBUFFER_HEIGHT: i64 = 0x8040;
const GLX_PBUFFER_WIDTH: i64 = 0x8041;

/// Trace handle maps for GLX objects
#[derive(Debug, Default)]
pub struct GlxRegistry {
    drawables: HandleMap<DrawableId>,
    contexts: HandleMap<ContextId>,
}

impl GlxRegistry {
    pub fn context(&self, handle: u64) -> Option<ContextId> {
        self.contexts.get(handle)
    }

    pub fn drawable(&self, handle: u64) -> Option<DrawableId> {
        self.drawables.get(handle)
    }
}

pub const CALLBACKS: &[Entry] = &[
    Entry { name: "glXChooseVisual", callback: ignore },
    Entry { name: "glXChooseFBConfig", callback: ignore },
    Entry { name: "glXChooseFBConfigSGIX", callback: ignore },
    Entry { name: "glXGetFBConfigs", callback: ignore },
    Entry { name: "glXGetFBConfigAttrib", callback: ignore },
    Entry { name: "glXGetVisualFromFBConfig", callback: ignore },
    Entry { name: "glXGetConfig", callback: ignore },
    Entry { name: "glXGetProcAddress", callback: ignore },
    Entry { name: "glXGetProcAddressARB", callback: ignore },
    Entry { name: "glXGetCurrentContext", callback: ignore },
    Entry { name: "glXGetCurrentDrawable", callback: ignore },
    Entry { name: "glXGetCurrentDisplay", callback: ignore },
    Entry { name: "glXGetClientString", callback: ignore },
    Entry { name: "glXQueryExtension", callback: ignore },
    Entry { name: "glXQueryExtensionsString", callback: ignore },
    Entry { name: "glXQueryServerString", callback: ignore },
    Entry { name: "glXQueryVersion", callback: ignore },
    Entry { name: "glXQueryDrawable", callback: ignore },
    Entry { name: "glXQueryContext", callback: ignore },
    Entry { name: "glXIsDirect", callback: ignore },
    Entry { name: "glXSwapIntervalEXT", callback: ignore },
    Entry { name: "glXSwapIntervalMESA", callback: ignore },
    Entry { name: "glXSwapIntervalSGI", callback: ignore },
    Entry { name: "glXWaitGL", callback: ignore },
    Entry { name: "glXWaitX", callback: ignore },
    Entry { name: "glXCreateWindow", callback: ignore },
    Entry { name: "glXDestroyWindow", callback: ignore },
    Entry { name: "glXCreateContext", callback: play_create_context },
    Entry { name: "glXCreateContextAttribsARB", callback: play_create_context_attribs },
    Entry { name: "glXCreateNewContext", callback: play_create_new_context },
    Entry { name: "glXDestroyContext", callback: play_destroy_context },
    Entry { name: "glXMakeCurrent", callback: play_make_current },
    Entry { name: "glXMakeContextCurrent", callback: play_make_context_current },
    Entry { name: "glXSwapBuffers", callback: play_swap_buffers },
    Entry { name: "glXCopySubBufferMESA", callback: play_copy_sub_buffer },
    Entry { name: "glXCreatePbuffer", callback: play_create_pbuffer },
    Entry { name: "glXDestroyPbuffer", callback: play_destroy_pbuffer },
];

/// Replay drawable for a trace handle, created on first sight
fn get_drawable(state: &mut ReplayState, handle: u64) -> Result<Option<DrawableId>> {
    if handle == 0 {
        return Ok(None);
    }
    if let Some(id) = state.glx.drawables.get(handle) {
        return Ok(Some(id));
    }
    let id = state.create_drawable()?;
    state.glx.drawables.insert(handle, id);
    Ok(Some(id))
}

/// Replay context for a trace handle, created on first sight
fn get_context(state: &mut ReplayState, call: &Call, handle: u64) -> Option<ContextId> {
    if handle == 0 {
        return None;
    }
    if let Some(id) = state.glx.contexts.get(handle) {
        return Some(id);
    }
    let id = create_context(state, call, None, None)?;
    state.glx.contexts.insert(handle, id);
    Some(id)
}

fn create_context(
    state: &mut ReplayState,
    call: &Call,
    share: Option<ContextId>,
    profile: Option<Profile>,
) -> Option<ContextId> {
    let created = state.create_context(share, profile);
    if created.is_none() {
        let profile = profile.unwrap_or(state.options.default_profile);
        state.warning(call, format!("Failed to create {} context", profile));
    }
    created
}

fn map_context(state: &mut ReplayState, handle: u64, id: ContextId) {
    if let Some(old) = state.glx.contexts.insert(handle, id) {
        state.resources.release_context(state.ws.as_mut(), old);
    }
}

fn play_create_context(state: &mut ReplayState, call: &Call) -> Result<()> {
    let share = get_context(state, call, call.arg(2).to_uint_ptr());
    if let Some(id) = create_context(state, call, share, None) {
        map_context(state, call.ret_or_null().to_uint_ptr(), id);
    }
    Ok(())
}

fn play_create_new_context(state: &mut ReplayState, call: &Call) -> Result<()> {
    let share = get_context(state, call, call.arg(3).to_uint_ptr());
    if let Some(id) = create_context(state, call, share, None) {
        map_context(state, call.ret_or_null().to_uint_ptr(), id);
    }
    Ok(())
}

fn play_create_context_attribs(state: &mut ReplayState, call: &Call) -> Result<()> {
    let share = get_context(state, call, call.arg(2).to_uint_ptr());
    let profile = context_profile(call.arg(4));
    if let Some(id) = create_context(state, call, share, Some(profile)) {
        map_context(state, call.ret_or_null().to_uint_ptr(), id);
    }
    Ok(())
}

fn play_destroy_context(state: &mut ReplayState, call: &Call) -> Result<()> {
    if let Some(id) = state.glx.contexts.remove(call.arg(1).to_uint_ptr()) {
        state.resources.release_context(state.ws.as_mut(), id);
    }
    Ok(())
}

fn play_make_current(state: &mut ReplayState, call: &Call) -> Result<()> {
    let drawable = get_drawable(state, call.arg(1).to_uint_ptr())?;
    let context = get_context(state, call, call.arg(2).to_uint_ptr());
    state.make_current(call, drawable, context)
}

fn play_make_context_current(state: &mut ReplayState, call: &Call) -> Result<()> {
    let drawable = get_drawable(state, call.arg(1).to_uint_ptr())?;
    let context = get_context(state, call, call.arg(3).to_uint_ptr());
    state.make_current(call, drawable, context)
}

fn play_swap_buffers(state: &mut ReplayState, call: &Call) -> Result<()> {
    let drawable = get_drawable(state, call.arg(1).to_uint_ptr())?;
    present(state, call, drawable, false)
}

/// Origin and size of a copy rectangle, if every component fits
fn sub_rect(call: &Call) -> Option<(i32, i32, u32, u32)> {
    Some((
        i32::try_from(call.arg(2).to_sint()).ok()?,
        i32::try_from(call.arg(3).to_sint()).ok()?,
        u32::try_from(call.arg(4).to_uint()).ok()?,
        u32::try_from(call.arg(5).to_uint()).ok()?,
    ))
}

fn play_copy_sub_buffer(state: &mut ReplayState, call: &Call) -> Result<()> {
    let Some(drawable) = get_drawable(state, call.arg(1).to_uint_ptr())? else {
        return Ok(());
    };
    match sub_rect(call) {
        Some((x, y, w, h)) => state.ws.copy_sub_buffer(drawable, x, y, w, h),
        None => state.warning(call, "copy rectangle out of range, call skipped"),
    }
    Ok(())
}

fn play_create_pbuffer(state: &mut ReplayState, call: &Call) -> Result<()> {
    let width = parse_attrib(call.arg(2), GLX_PBUFFER_WIDTH, 0).max(0) as u32;
    let height = parse_attrib(call.arg(2), GLX_PBUFFER_HEIGHT, 0).max(0) as u32;
    let profile = state.options.default_profile;
    let id = state
        .resources
        .create_pbuffer(state.ws.as_mut(), profile, width, height)?;
    if let Some(old) = state.glx.drawables.insert(call.ret_or_null().to_uint_ptr(), id) {
        state.resources.release_drawable(state.ws.as_mut(), old);
    }
    Ok(())
}

fn play_destroy_pbuffer(state: &mut ReplayState, call: &Call) -> Result<()> {
    if let Some(id) = state.glx.drawables.remove(call.arg(1).to_uint_ptr()) {
        state.resources.release_drawable(state.ws.as_mut(), id);
    }
    Ok(())
}
