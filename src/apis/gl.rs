//! Core GL entry points
//!
//! Most GL calls need nothing beyond being executed on the current context.
//! The generic handler does that, tracking the few bits of state replay
//! itself depends on: drawable size from viewports and blits, bound buffer
//! objects, the active program for profiling, and whether the context is
//! recording a display list or inside `glBegin`/`glEnd`.

use crate::call::Call;
use crate::error::Result;
use crate::player::{ignore, Entry, Fallback};
use crate::state::ReplayState;

const GL_ARRAY_BUFFER: u64 = 0x8892;
const GL_ELEMENT_ARRAY_BUFFER: u64 = 0x8893;
const GL_PIXEL_PACK_BUFFER: u64 = 0x88EB;

/// Calls that write into client memory unless a pixel pack buffer is bound
const PACK_FUNCTIONS: &[&str] = &[
    "glGetTexImage",
    "glGetTexImageEXT",
    "glGetCompressedTexImage",
    "glGetCompressedTexImageARB",
    "glGetnTexImage",
    "glGetnCompressedTexImage",
    "glGetTextureImage",
    "glGetCompressedTextureImage",
    "glGetTextureSubImage",
    "glGetCompressedTextureSubImage",
    "glReadPixels",
    "glReadnPixels",
    "glReadnPixelsARB",
    "glReadnPixelsEXT",
];

/// Calls profiled as draws even when the trace did not flag them
const DRAW_FUNCTIONS: &[&str] = &[
    "glBegin",
    "glDrawArrays",
    "glDrawArraysEXT",
    "glDrawArraysIndirect",
    "glDrawArraysInstanced",
    "glDrawArraysInstancedBaseInstance",
    "glDrawElements",
    "glDrawElementsBaseVertex",
    "glDrawElementsIndirect",
    "glDrawElementsInstanced",
    "glDrawElementsInstancedBaseVertex",
    "glDrawElementsInstancedBaseVertexBaseInstance",
    "glDrawRangeElements",
    "glDrawRangeElementsBaseVertex",
    "glMultiDrawArrays",
    "glMultiDrawArraysIndirect",
    "glMultiDrawElements",
    "glMultiDrawElementsBaseVertex",
    "glMultiDrawElementsIndirect",
    "glCallList",
    "glCallLists",
    "glDispatchCompute",
    "glDispatchComputeIndirect",
];

pub const CALLBACKS: &[Entry] = &[
    Entry {
        name: "glFrameTerminatorGREMEDY",
        callback: play_frame_terminator,
    },
    Entry {
        name: "glStringMarkerGREMEDY",
        callback: ignore,
    },
    Entry {
        name: "glGetError",
        callback: ignore,
    },
];

pub const FALLBACK: Fallback = Fallback {
    matches: is_core_call,
    callback: play_call,
};

/// `gl` followed by an upper-case letter, excluding `glX` window-system calls
pub fn is_core_call(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("gl") else {
        return false;
    };
    rest.starts_with(|c: char| c.is_ascii_uppercase()) && !rest.starts_with('X')
}

fn play_frame_terminator(state: &mut ReplayState, call: &Call) -> Result<()> {
    state.frame_complete(call)
}

/// Generic replay of a core GL call against the current context
pub fn play_call(state: &mut ReplayState, call: &Call) -> Result<()> {
    let name = call.name();
    let Some(ctx) = state.resources.current_context_mut() else {
        // Without a context the call would be undefined; traces captured
        // from apps that leak calls across unbinds hit this.
        return Ok(());
    };

    if ctx.pixel_pack_buffer == 0 && PACK_FUNCTIONS.contains(&name) {
        return Ok(());
    }

    match name {
        "glEnd" => ctx.inside_begin_end = false,
        "glNewList" => ctx.inside_list = true,
        "glBindBuffer" | "glBindBufferARB" => {
            let buffer = call.arg(1).to_uint() as u32;
            match call.arg(0).to_uint() {
                GL_ARRAY_BUFFER => ctx.array_buffer = buffer,
                GL_ELEMENT_ARRAY_BUFFER => ctx.element_array_buffer = buffer,
                GL_PIXEL_PACK_BUFFER => ctx.pixel_pack_buffer = buffer,
                _ => {}
            }
        }
        "glUseProgram" | "glUseProgramObjectARB" => {
            ctx.program = call.arg(0).to_uint() as u32;
            ctx.active_program = ctx.program;
        }
        "glBindProgramPipeline" => {
            ctx.program_pipeline = call.arg(0).to_uint() as u32;
            if ctx.program == 0 {
                ctx.active_program = ctx
                    .pipeline_programs
                    .get(&ctx.program_pipeline)
                    .copied()
                    .unwrap_or(0);
            }
        }
        "glActiveShaderProgram" => {
            let pipeline = call.arg(0).to_uint() as u32;
            let program = call.arg(1).to_uint() as u32;
            ctx.pipeline_programs.insert(pipeline, program);
            if ctx.program == 0 && ctx.program_pipeline == pipeline {
                ctx.active_program = program;
            }
        }
        _ => {}
    }
    let recording = ctx.inside_list || ctx.inside_begin_end;

    let profiled = state.profiling() && name != "glEnd" && !recording;
    if profiled {
        let is_draw = call.is_draw() || DRAW_FUNCTIONS.contains(&name);
        state.begin_profile(call, is_draw);
    }

    state.ws.execute(call);
    update_drawable_size(state, call);

    let (inside_list, inside_begin_end) = match state.resources.current_context_mut() {
        Some(ctx) => {
            match name {
                "glBegin" => ctx.inside_begin_end = true,
                "glEndList" => ctx.inside_list = false,
                _ => {}
            }
            (ctx.inside_list, ctx.inside_begin_end)
        }
        None => (false, false),
    };

    // A glBegin profile stays open until its glEnd.
    if (profiled || name == "glEnd") && !inside_list && !inside_begin_end {
        state.end_profile();
    }

    if state.options.debug && !inside_begin_end {
        state.check_errors(call);
    }

    if !state.options.double_buffer && matches!(name, "glFlush" | "glFinish") {
        state.frame_complete(call)?;
    }
    Ok(())
}

/// Grow the window so a viewport or blit destination fits
fn update_drawable_size(state: &mut ReplayState, call: &Call) {
    match call.name() {
        "glViewport" => {
            let (x, y) = (call.arg(0).to_sint(), call.arg(1).to_sint());
            let (w, h) = (call.arg(2).to_sint(), call.arg(3).to_sint());
            state.update_drawable(x + w, y + h);
        }
        "glViewportIndexedf" | "glViewportIndexedfv" | "glViewportArrayv" => {
            let values: Vec<f64> = viewport_values(call);
            for v in values.chunks_exact(4) {
                state.update_drawable((v[0] + v[2]) as i64, (v[1] + v[3]) as i64);
            }
        }
        "glBlitFramebuffer" | "glBlitFramebufferEXT" | "glBlitNamedFramebuffer" => {
            let base = if call.name() == "glBlitNamedFramebuffer" { 2 } else { 0 };
            let dst_x1 = call.arg(base + 4).to_sint();
            let dst_y1 = call.arg(base + 5).to_sint();
            let dst_x2 = call.arg(base + 6).to_sint();
            let dst_y2 = call.arg(base + 7).to_sint();
            state.update_drawable(dst_x1.max(dst_x2), dst_y1.max(dst_y2));
        }
        _ => {}
    }
}

fn viewport_values(call: &Call) -> Vec<f64> {
    use crate::call::Value;
    let as_f64 = |v: &Value| match v {
        Value::Float(f) => *f,
        other => other.to_sint() as f64,
    };
    match call.name() {
        "glViewportIndexedf" => (1..5).map(|i| as_f64(call.arg(i))).collect(),
        "glViewportIndexedfv" => call
            .arg(1)
            .as_array()
            .map(|a| a.iter().map(as_f64).collect())
            .unwrap_or_default(),
        _ => call
            .arg(2)
            .as_array()
            .map(|a| a.iter().map(as_f64).collect())
            .unwrap_or_default(),
    }
}
