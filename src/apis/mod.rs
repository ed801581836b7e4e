//! Replay handlers per API family
//!
//! Each family module exports a `CALLBACKS` table for [`Player`]. The core
//! GL module also exports a fallback that claims every `gl*` entry point
//! without a dedicated handler.

pub mod egl;
pub mod gl;
pub mod glx;
pub mod stdc;
pub mod wgl;

use crate::call::{Call, Value};
use crate::error::Result;
use crate::player::Player;
use crate::state::ReplayState;
use crate::ws::{DrawableId, Profile};

/// Context attribute names shared by GLX_ARB_create_context and
/// WGL_ARB_create_context
pub(crate) const CONTEXT_MAJOR_VERSION: i64 = 0x2091;
pub(crate) const CONTEXT_MINOR_VERSION: i64 = 0x2092;
pub(crate) const CONTEXT_PROFILE_MASK: i64 = 0x9126;
pub(crate) const CONTEXT_CORE_PROFILE_BIT: i64 = 0x0001;

pub fn register_all(player: &mut Player) {
    player.add_callbacks(stdc::CALLBACKS);
    player.add_callbacks(gl::CALLBACKS);
    player.add_callbacks(glx::CALLBACKS);
    player.add_callbacks(egl::CALLBACKS);
    player.add_callbacks(wgl::CALLBACKS);
    player.add_fallback(gl::FALLBACK);
}

/// Look up `param` in a zero-terminated name/value attribute list
pub(crate) fn parse_attrib(attribs: &Value, param: i64, default: i64) -> i64 {
    let Some(values) = attribs.as_array() else {
        return default;
    };
    for pair in values.chunks(2) {
        let name = pair[0].to_sint();
        if name == 0 {
            break;
        }
        if name == param {
            return pair.get(1).map(Value::to_sint).unwrap_or(default);
        }
    }
    default
}

/// Profile requested by an `*_ARB_create_context` attribute list
pub(crate) fn context_profile(attribs: &Value) -> Profile {
    let major = parse_attrib(attribs, CONTEXT_MAJOR_VERSION, 1);
    let minor = parse_attrib(attribs, CONTEXT_MINOR_VERSION, 0);
    let mask = parse_attrib(attribs, CONTEXT_PROFILE_MASK, CONTEXT_CORE_PROFILE_BIT);
    let core = mask & CONTEXT_CORE_PROFILE_BIT != 0;
    Profile::from_version(major.max(0) as u32, minor.max(0) as u32, core)
}

/// Common tail of every swap-buffers entry point
///
/// With a single-buffered visual the swap becomes a flush; otherwise the
/// given drawable is presented, or the current one when none was named and
/// `or_current` is set.
pub(crate) fn present(
    state: &mut ReplayState,
    call: &Call,
    drawable: Option<DrawableId>,
    or_current: bool,
) -> Result<()> {
    state.frame_complete(call)?;
    if !state.options.double_buffer {
        state.ws.flush();
        return Ok(());
    }
    let target = drawable.or_else(|| {
        or_current
            .then(|| state.resources.current_drawable().map(|d| d.id))
            .flatten()
    });
    if let Some(d) = target {
        state.ws.swap_buffers(d);
    }
    Ok(())
}
