//! WGL entry points
//!
//! Device contexts map to drawables and are created on first use. Pbuffers
//! are reached through the DC `wglGetPbufferDCARB` returns, so that DC maps
//! to the pbuffer's drawable.

use super::{context_profile, present};
use crate::call::{Call, Value};
use crate::error::Result;
use crate::player::{ignore, Entry};
use crate::registry::HandleMap;
use crate::state::ReplayState;
use crate::ws::{ContextId, DrawableId};

/// Trace handle maps for WGL objects
#[derive(Debug, Default)]
pub struct WglRegistry {
    /// HDC to drawable
    drawables: HandleMap<DrawableId>,
    /// HPBUFFERARB to drawable
    pbuffers: HandleMap<DrawableId>,
    /// HGLRC to context
    contexts: HandleMap<ContextId>,
}

impl WglRegistry {
    pub fn context(&self, handle: u64) -> Option<ContextId> {
        self.contexts.get(handle)
    }

    pub fn drawable(&self, handle: u64) -> Option<DrawableId> {
        self.drawables.get(handle)
    }

    pub fn pbuffer(&self, handle: u64) -> Option<DrawableId> {
        self.pbuffers.get(handle)
    }
}

pub const CALLBACKS: &[Entry] = &[
    Entry { name: "wglChoosePixelFormat", callback: ignore },
    Entry { name: "wglChoosePixelFormatARB", callback: ignore },
    Entry { name: "wglDescribePixelFormat", callback: ignore },
    Entry { name: "wglGetPixelFormat", callback: ignore },
    Entry { name: "wglSetPixelFormat", callback: ignore },
    Entry { name: "wglGetPixelFormatAttribivARB", callback: ignore },
    Entry { name: "wglGetPixelFormatAttribfvARB", callback: ignore },
    Entry { name: "wglGetCurrentContext", callback: ignore },
    Entry { name: "wglGetCurrentDC", callback: ignore },
    Entry { name: "wglGetProcAddress", callback: ignore },
    Entry { name: "wglGetExtensionsStringARB", callback: ignore },
    Entry { name: "wglGetExtensionsStringEXT", callback: ignore },
    Entry { name: "wglSwapIntervalEXT", callback: ignore },
    Entry { name: "wglGetSwapIntervalEXT", callback: ignore },
    Entry { name: "wglQueryPbufferARB", callback: ignore },
    Entry { name: "wglUseFontBitmapsA", callback: ignore },
    Entry { name: "wglUseFontBitmapsW", callback: ignore },
    Entry { name: "wglCreateContext", callback: play_create_context },
    Entry { name: "wglCreateLayerContext", callback: play_create_context },
    Entry { name: "wglCreateContextAttribsARB", callback: play_create_context_attribs },
    Entry { name: "wglDeleteContext", callback: play_delete_context },
    Entry { name: "wglMakeCurrent", callback: play_make_current },
    Entry { name: "wglMakeContextCurrentARB", callback: play_make_context_current },
    Entry { name: "wglSwapBuffers", callback: play_swap_buffers },
    Entry { name: "wglSwapLayerBuffers", callback: play_swap_buffers },
    Entry { name: "wglShareLists", callback: play_share_lists },
    Entry { name: "wglCreatePbufferARB", callback: play_create_pbuffer },
    Entry { name: "wglGetPbufferDCARB", callback: play_get_pbuffer_dc },
    Entry { name: "wglReleasePbufferDCARB", callback: play_release_pbuffer_dc },
    Entry { name: "wglDestroyPbufferARB", callback: play_destroy_pbuffer },
];

fn get_drawable(state: &mut ReplayState, hdc: u64) -> Result<Option<DrawableId>> {
    if hdc == 0 {
        return Ok(None);
    }
    if let Some(id) = state.wgl.drawables.get(hdc) {
        return Ok(Some(id));
    }
    let id = state.create_drawable()?;
    state.wgl.drawables.insert(hdc, id);
    Ok(Some(id))
}

fn map_context(state: &mut ReplayState, hglrc: u64, id: ContextId) {
    if let Some(old) = state.wgl.contexts.insert(hglrc, id) {
        state.resources.release_context(state.ws.as_mut(), old);
    }
}

fn succeeded(call: &Call) -> bool {
    call.ret.as_ref().map(Value::to_bool).unwrap_or(true)
}

fn play_create_context(state: &mut ReplayState, call: &Call) -> Result<()> {
    match state.create_context(None, None) {
        Some(id) => map_context(state, call.ret_or_null().to_uint_ptr(), id),
        None => {
            let profile = state.options.default_profile;
            state.warning(call, format!("Failed to create {} context", profile));
        }
    }
    Ok(())
}

fn play_create_context_attribs(state: &mut ReplayState, call: &Call) -> Result<()> {
    let share = state.wgl.contexts.get(call.arg(1).to_uint_ptr());
    let profile = context_profile(call.arg(2));
    match state.create_context(share, Some(profile)) {
        Some(id) => map_context(state, call.ret_or_null().to_uint_ptr(), id),
        None => state.warning(call, format!("Failed to create {} context", profile)),
    }
    Ok(())
}

fn play_delete_context(state: &mut ReplayState, call: &Call) -> Result<()> {
    if let Some(id) = state.wgl.contexts.remove(call.arg(0).to_uint_ptr()) {
        state.resources.release_context(state.ws.as_mut(), id);
    }
    Ok(())
}

fn play_make_current(state: &mut ReplayState, call: &Call) -> Result<()> {
    let hglrc = call.arg(1).to_uint_ptr();
    // A failed call in the trace left nothing bound.
    let (drawable, context) = if succeeded(call) && hglrc != 0 {
        let drawable = get_drawable(state, call.arg(0).to_uint_ptr())?;
        (drawable, state.wgl.contexts.get(hglrc))
    } else {
        (None, None)
    };
    state.make_current(call, drawable, context)
}

fn play_make_context_current(state: &mut ReplayState, call: &Call) -> Result<()> {
    let hglrc = call.arg(2).to_uint_ptr();
    let (drawable, context) = if succeeded(call) && hglrc != 0 {
        let drawable = get_drawable(state, call.arg(0).to_uint_ptr())?;
        (drawable, state.wgl.contexts.get(hglrc))
    } else {
        (None, None)
    };
    state.make_current(call, drawable, context)
}

fn play_swap_buffers(state: &mut ReplayState, call: &Call) -> Result<()> {
    let drawable = get_drawable(state, call.arg(0).to_uint_ptr())?;
    present(state, call, drawable, true)
}

/// Rebuild the second context so it shares objects with the first
///
/// The replacement takes over the trace handle and, if the old context was
/// current, the binding, before the old context is released.
fn play_share_lists(state: &mut ReplayState, call: &Call) -> Result<()> {
    let source = state.wgl.contexts.get(call.arg(0).to_uint_ptr());
    let hglrc = call.arg(1).to_uint_ptr();
    let old = state.wgl.contexts.get(hglrc);

    let Some(new) = state.create_context(source, None) else {
        let profile = state.options.default_profile;
        state.warning(call, format!("Failed to create {} context", profile));
        return Ok(());
    };

    if old.is_some() && state.resources.current_context_id() == old {
        let drawable = state.resources.current_drawable().map(|d| d.id);
        state.make_current(call, drawable, Some(new))?;
    }
    map_context(state, hglrc, new);
    Ok(())
}

fn play_create_pbuffer(state: &mut ReplayState, call: &Call) -> Result<()> {
    let width = call.arg(2).to_sint().max(0) as u32;
    let height = call.arg(3).to_sint().max(0) as u32;
    let profile = state.options.default_profile;
    let id = state
        .resources
        .create_pbuffer(state.ws.as_mut(), profile, width, height)?;
    if let Some(old) = state.wgl.pbuffers.insert(call.ret_or_null().to_uint_ptr(), id) {
        state.resources.release_drawable(state.ws.as_mut(), old);
    }
    Ok(())
}

fn play_get_pbuffer_dc(state: &mut ReplayState, call: &Call) -> Result<()> {
    let Some(pbuffer) = state.wgl.pbuffers.get(call.arg(0).to_uint_ptr()) else {
        state.warning(call, "unknown pbuffer");
        return Ok(());
    };
    let hdc = call.ret_or_null().to_uint_ptr();
    if state.wgl.drawables.get(hdc) == Some(pbuffer) {
        return Ok(());
    }
    state.resources.retain_drawable(pbuffer);
    if let Some(old) = state.wgl.drawables.insert(hdc, pbuffer) {
        state.resources.release_drawable(state.ws.as_mut(), old);
    }
    Ok(())
}

fn play_release_pbuffer_dc(state: &mut ReplayState, call: &Call) -> Result<()> {
    if let Some(id) = state.wgl.drawables.remove(call.arg(1).to_uint_ptr()) {
        state.resources.release_drawable(state.ws.as_mut(), id);
    }
    Ok(())
}

fn play_destroy_pbuffer(state: &mut ReplayState, call: &Call) -> Result<()> {
    if let Some(id) = state.wgl.pbuffers.remove(call.arg(0).to_uint_ptr()) {
        state.resources.release_drawable(state.ws.as_mut(), id);
    }
    Ok(())
}
