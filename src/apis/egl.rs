//! EGL entry points
//!
//! EGL records the client API and version a context is created for, so
//! contexts are never synthesized here: a context handle the trace never
//! created stays unbound. Surfaces are still created on first use, with the
//! profile of the last context created for their config.

use super::{parse_attrib, present};
use crate::call::Call;
use crate::error::{ReplayError, Result};
use crate::player::{ignore, Entry};
use crate::registry::HandleMap;
use crate::state::ReplayState;
use crate::ws::{ContextId, DrawableId, Profile};
use std::collections::HashMap;

const EGL_HEIGHT: i64 = 0x3056;
const EGL_WIDTH: i64 = 0x3057;
const EGL_CONTEXT_CLIENT_VERSION: i64 = 0x3098;
const EGL_OPENGL_ES_API: u64 = 0x30A0;
const EGL_OPENGL_API: u64 = 0x30A2;

/// Trace handle maps and API selection state for EGL
#[derive(Debug)]
pub struct EglRegistry {
    drawables: HandleMap<DrawableId>,
    contexts: HandleMap<ContextId>,
    /// Profile of the last context created per config
    profiles: HashMap<u64, Profile>,
    last_profile: Profile,
    current_api: u64,
}

impl Default for EglRegistry {
    fn default() -> Self {
        Self {
            drawables: HandleMap::new(),
            contexts: HandleMap::new(),
            profiles: HashMap::new(),
            last_profile: Profile::Es2,
            current_api: EGL_OPENGL_ES_API,
        }
    }
}

impl EglRegistry {
    pub fn context(&self, handle: u64) -> Option<ContextId> {
        self.contexts.get(handle)
    }

    pub fn drawable(&self, handle: u64) -> Option<DrawableId> {
        self.drawables.get(handle)
    }

    fn profile_for(&self, config: u64) -> Profile {
        self.profiles.get(&config).copied().unwrap_or(self.last_profile)
    }
}

pub const CALLBACKS: &[Entry] = &[
    Entry { name: "eglGetError", callback: ignore },
    Entry { name: "eglGetDisplay", callback: ignore },
    Entry { name: "eglGetPlatformDisplay", callback: ignore },
    Entry { name: "eglGetPlatformDisplayEXT", callback: ignore },
    Entry { name: "eglInitialize", callback: ignore },
    Entry { name: "eglTerminate", callback: ignore },
    Entry { name: "eglQueryString", callback: ignore },
    Entry { name: "eglGetConfigs", callback: ignore },
    Entry { name: "eglChooseConfig", callback: ignore },
    Entry { name: "eglGetConfigAttrib", callback: ignore },
    Entry { name: "eglQuerySurface", callback: ignore },
    Entry { name: "eglSurfaceAttrib", callback: ignore },
    Entry { name: "eglQueryAPI", callback: ignore },
    Entry { name: "eglWaitClient", callback: ignore },
    Entry { name: "eglWaitGL", callback: ignore },
    Entry { name: "eglWaitNative", callback: ignore },
    Entry { name: "eglReleaseThread", callback: ignore },
    Entry { name: "eglSwapInterval", callback: ignore },
    Entry { name: "eglGetCurrentContext", callback: ignore },
    Entry { name: "eglGetCurrentSurface", callback: ignore },
    Entry { name: "eglGetCurrentDisplay", callback: ignore },
    Entry { name: "eglQueryContext", callback: ignore },
    Entry { name: "eglGetProcAddress", callback: ignore },
    Entry { name: "eglCreateWindowSurface", callback: play_create_surface },
    Entry { name: "eglCreatePlatformWindowSurface", callback: play_create_surface },
    Entry { name: "eglCreatePlatformWindowSurfaceEXT", callback: play_create_surface },
    Entry { name: "eglCreatePixmapSurface", callback: play_create_surface },
    Entry { name: "eglCreatePbufferSurface", callback: play_create_pbuffer_surface },
    Entry { name: "eglDestroySurface", callback: play_destroy_surface },
    Entry { name: "eglBindAPI", callback: play_bind_api },
    Entry { name: "eglCreateContext", callback: play_create_context },
    Entry { name: "eglDestroyContext", callback: play_destroy_context },
    Entry { name: "eglMakeCurrent", callback: play_make_current },
    Entry { name: "eglSwapBuffers", callback: play_swap_buffers },
    Entry { name: "eglSwapBuffersWithDamageEXT", callback: play_swap_buffers },
    Entry { name: "eglSwapBuffersWithDamageKHR", callback: play_swap_buffers },
];

fn get_drawable(state: &mut ReplayState, handle: u64) -> Result<Option<DrawableId>> {
    if handle == 0 {
        return Ok(None);
    }
    if let Some(id) = state.egl.drawables.get(handle) {
        return Ok(Some(id));
    }
    let profile = state.egl.profile_for(0);
    let id = state.resources.create_drawable(state.ws.as_mut(), profile)?;
    state.egl.drawables.insert(handle, id);
    Ok(Some(id))
}

fn map_drawable(state: &mut ReplayState, handle: u64, id: DrawableId) {
    if let Some(old) = state.egl.drawables.insert(handle, id) {
        state.resources.release_drawable(state.ws.as_mut(), old);
    }
}

fn play_create_surface(state: &mut ReplayState, call: &Call) -> Result<()> {
    let profile = state.egl.profile_for(call.arg(1).to_uint_ptr());
    let id = state.resources.create_drawable(state.ws.as_mut(), profile)?;
    map_drawable(state, call.ret_or_null().to_uint_ptr(), id);
    Ok(())
}

fn play_create_pbuffer_surface(state: &mut ReplayState, call: &Call) -> Result<()> {
    let profile = state.egl.profile_for(call.arg(1).to_uint_ptr());
    let width = parse_attrib(call.arg(2), EGL_WIDTH, 0);
    let height = parse_attrib(call.arg(2), EGL_HEIGHT, 0);
    let id = if width > 0 && height > 0 {
        state
            .resources
            .create_pbuffer(state.ws.as_mut(), profile, width as u32, height as u32)?
    } else {
        state.resources.create_drawable(state.ws.as_mut(), profile)?
    };
    map_drawable(state, call.ret_or_null().to_uint_ptr(), id);
    Ok(())
}

fn play_destroy_surface(state: &mut ReplayState, call: &Call) -> Result<()> {
    if let Some(id) = state.egl.drawables.remove(call.arg(1).to_uint_ptr()) {
        state.resources.release_drawable(state.ws.as_mut(), id);
    }
    Ok(())
}

fn play_bind_api(state: &mut ReplayState, call: &Call) -> Result<()> {
    state.egl.current_api = call.arg(0).to_uint();
    Ok(())
}

fn play_create_context(state: &mut ReplayState, call: &Call) -> Result<()> {
    let config = call.arg(1).to_uint_ptr();
    let share = state.egl.contexts.get(call.arg(2).to_uint_ptr());

    let profile = match state.egl.current_api {
        EGL_OPENGL_API => Profile::Compat,
        EGL_OPENGL_ES_API => {
            if parse_attrib(call.arg(3), EGL_CONTEXT_CLIENT_VERSION, 1) >= 2 {
                Profile::Es2
            } else {
                Profile::Es1
            }
        }
        other => {
            state.warning(call, format!("unknown client API 0x{:x}", other));
            return Ok(());
        }
    };

    let Some(id) = state.create_context(share, Some(profile)) else {
        return Err(ReplayError::ContextCreation {
            profile: profile.to_string(),
        });
    };
    if let Some(old) = state.egl.contexts.insert(call.ret_or_null().to_uint_ptr(), id) {
        state.resources.release_context(state.ws.as_mut(), old);
    }
    state.egl.profiles.insert(config, profile);
    state.egl.last_profile = profile;
    Ok(())
}

fn play_destroy_context(state: &mut ReplayState, call: &Call) -> Result<()> {
    if let Some(id) = state.egl.contexts.remove(call.arg(1).to_uint_ptr()) {
        state.resources.release_context(state.ws.as_mut(), id);
    }
    Ok(())
}

fn play_make_current(state: &mut ReplayState, call: &Call) -> Result<()> {
    let drawable = get_drawable(state, call.arg(1).to_uint_ptr())?;
    let context = state.egl.contexts.get(call.arg(3).to_uint_ptr());
    state.make_current(call, drawable, context)
}

fn play_swap_buffers(state: &mut ReplayState, call: &Call) -> Result<()> {
    let drawable = get_drawable(state, call.arg(1).to_uint_ptr())?;
    present(state, call, drawable, false)
}
