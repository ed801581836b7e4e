//! Mutable replay state shared by all API family handlers
//!
//! [`ReplayState`] is what every dispatch callback receives: the window
//! system, the object registries, the profiler and the frame counter. It is
//! owned by the replay session and moves between relay runners with it, so
//! only one thread ever touches it at a time.

use crate::apis::{egl::EglRegistry, glx::GlxRegistry, stdc::MemoryRegions, wgl::WglRegistry};
use crate::call::Call;
use crate::error::{ReplayError, Result};
use crate::profiling::CallProfiler;
use crate::registry::Resources;
use crate::ws::{ContextId, DrawableId, Profile, Severity, WindowSystem};
use serde_json::json;
use std::fmt::Display;

/// Limit on low-severity driver debug messages echoed to stderr
const MAX_LOW_SEVERITY_MESSAGES: u32 = 1000;

/// Driver message id that is purely informational and high frequency
const BUFFER_INFO_MESSAGE_ID: u32 = 131185;

/// Knobs that affect how handlers replay calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateOptions {
    /// Present on swap; otherwise flush and treat flush/finish as frame ends
    pub double_buffer: bool,
    /// Check API errors and print warnings
    pub debug: bool,
    /// Profile used for contexts and drawables created on demand
    pub default_profile: Profile,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            double_buffer: true,
            debug: true,
            default_profile: Profile::Compat,
        }
    }
}

pub struct ReplayState {
    pub ws: Box<dyn WindowSystem>,
    pub resources: Resources,
    pub glx: GlxRegistry,
    pub egl: EglRegistry,
    pub wgl: WglRegistry,
    pub regions: MemoryRegions,
    pub profiler: Option<CallProfiler>,
    pub options: StateOptions,
    frames: u64,
    warnings: u64,
    debug_output: bool,
    low_severity_left: u32,
}

impl ReplayState {
    pub fn new(ws: Box<dyn WindowSystem>, options: StateOptions, profiler: Option<CallProfiler>) -> Self {
        Self {
            ws,
            resources: Resources::new(),
            glx: GlxRegistry::default(),
            egl: EglRegistry::default(),
            wgl: WglRegistry::default(),
            regions: MemoryRegions::default(),
            profiler,
            options,
            frames: 0,
            warnings: 0,
            debug_output: false,
            low_severity_left: MAX_LOW_SEVERITY_MESSAGES,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn warnings(&self) -> u64 {
        self.warnings
    }

    pub fn profiling(&self) -> bool {
        self.profiler.is_some()
    }

    /// Report a non-fatal replay problem against `call`
    pub fn warning(&mut self, call: &Call, message: impl Display) {
        self.warnings += 1;
        tracing::debug!(call_no = call.no, call = call.name(), "{}", message);
        if self.options.debug {
            eprintln!("{}: warning: {}", call.no, message);
        }
    }

    pub fn create_drawable(&mut self) -> Result<DrawableId> {
        let profile = self.options.default_profile;
        self.resources.create_drawable(self.ws.as_mut(), profile)
    }

    pub fn create_context(&mut self, share: Option<ContextId>, profile: Option<Profile>) -> Option<ContextId> {
        let profile = profile.unwrap_or(self.options.default_profile);
        self.resources.create_context(self.ws.as_mut(), share, profile)
    }

    /// Switch the current binding
    ///
    /// Outstanding profiling queries of the outgoing context are resolved
    /// first. A context bound with a drawable for the first time is queried
    /// for the extensions profiling relies on.
    pub fn make_current(
        &mut self,
        call: &Call,
        drawable: Option<DrawableId>,
        context: Option<ContextId>,
    ) -> Result<()> {
        let current = self.resources.current_context_id();
        let current_drawable = self.resources.current_drawable().map(|d| d.id);
        if current == context && current_drawable == drawable {
            return Ok(());
        }

        if current.is_some() {
            self.flush_queries()?;
            self.ws.flush();
        }

        if !self.resources.bind(self.ws.as_mut(), drawable, context) {
            return Err(ReplayError::WindowSystem(format!(
                "{}: failed to make current OpenGL context and drawable",
                call.no
            )));
        }

        if drawable.is_some() {
            let first_use = self
                .resources
                .current_context_mut()
                .map(|ctx| !std::mem::replace(&mut ctx.used, true))
                .unwrap_or(false);
            if first_use {
                self.init_context()?;
            }
        }
        Ok(())
    }

    fn init_context(&mut self) -> Result<()> {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.check_support(self.ws.as_ref())?;
        }
        self.debug_output = self.options.debug && self.ws.has_extension("GL_ARB_debug_output");
        Ok(())
    }

    /// Count one frame-ending call
    pub fn count_frame(&mut self) {
        self.frames += 1;
    }

    /// Close the frame for the profiler and check the drawable was sized
    pub fn frame_complete(&mut self, call: &Call) -> Result<()> {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.frame_end(self.ws.as_mut())?;
        }

        if self.resources.current_context().is_none() {
            return Ok(());
        }
        let visible = self.resources.current_drawable().map(|d| d.visible);
        if self.options.debug && visible == Some(false) {
            self.warning(call, "could not infer drawable size (glViewport never called)");
        }
        Ok(())
    }

    /// Grow the current window to cover a viewport or blit of this size
    pub fn update_drawable(&mut self, width: i64, height: i64) {
        if width <= 0 || height <= 0 {
            return;
        }
        let (width, height) = (width as u32, height as u32);
        let Some(drawable) = self.resources.current_drawable_mut() else {
            return;
        };
        if drawable.pbuffer {
            return;
        }
        if drawable.visible && width <= drawable.width && height <= drawable.height {
            return;
        }

        drawable.width = drawable.width.max(width);
        drawable.height = drawable.height.max(height);
        drawable.visible = true;
        let (id, w, h) = (drawable.id, drawable.width, drawable.height);
        self.ws.resize_drawable(id, w, h);
        self.ws.show_drawable(id);
    }

    pub fn begin_profile(&mut self, call: &Call, is_draw: bool) {
        let program = self
            .resources
            .current_context()
            .map(|c| c.active_program)
            .unwrap_or(0);
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.begin(self.ws.as_mut(), call, is_draw, program);
        }
    }

    pub fn end_profile(&mut self) {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.end(self.ws.as_mut());
        }
    }

    fn flush_queries(&mut self) -> Result<()> {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.flush(self.ws.as_mut())?;
        }
        Ok(())
    }

    /// Report pending API errors and driver debug output for `call`
    pub fn check_errors(&mut self, call: &Call) {
        for error in self.ws.take_errors() {
            let message = format!("glGetError({}) = {}", call.name(), gl_error_name(error));
            self.warning(call, message);
        }

        if !self.debug_output {
            return;
        }
        for msg in self.ws.take_debug_messages() {
            if msg.source == "API"
                && msg.kind == "other issue"
                && msg.severity == Severity::Low
                && msg.id == BUFFER_INFO_MESSAGE_ID
            {
                continue;
            }
            if msg.severity == Severity::Low {
                if self.low_severity_left == 0 {
                    continue;
                }
                self.low_severity_left -= 1;
                if self.low_severity_left == 0 {
                    eprintln!("{}: glDebugOutputCallback: too many low severity messages", call.no);
                    continue;
                }
            }
            eprintln!(
                "{}: glDebugOutputCallback: {} severity {} {} {}, {}",
                call.no, msg.severity, msg.source, msg.kind, msg.id, msg.message
            );
        }
    }

    /// Resolve profiling queries; used before handing the baton on
    pub fn flush_rendering(&mut self) -> Result<()> {
        if self.resources.current_context().is_some() {
            self.flush_queries()?;
        }
        Ok(())
    }

    /// Wait for the GPU to drain
    pub fn finish_rendering(&mut self) -> Result<()> {
        if self.resources.current_context().is_some() {
            self.flush_queries()?;
            self.ws.finish();
        }
        Ok(())
    }

    /// Read back the current draw buffer, if anything is bound
    pub fn snapshot(&mut self) -> Option<crate::snapshot::Image> {
        self.resources.current_context()?;
        self.ws.read_draw_buffer()
    }

    /// JSON description of the current context; `None` when nothing is
    /// bound or the context is inside a begin/end pair
    pub fn dump_state(&self) -> Option<serde_json::Value> {
        let context = self.resources.current_context()?;
        if context.inside_begin_end {
            return None;
        }
        Some(json!({
            "frames": self.frames,
            "context": context,
            "drawable": self.resources.current_drawable(),
            "live_contexts": self.resources.context_count(),
            "live_drawables": self.resources.drawable_count(),
        }))
    }

    /// Keep presenting until the window system says to stop
    pub fn wait_for_input(&mut self) -> Result<()> {
        self.flush_rendering()?;
        while self.ws.process_events() {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        Ok(())
    }

    /// Destroy every replay object
    pub fn tear_down(&mut self) {
        self.resources.clear(self.ws.as_mut());
    }
}

impl std::fmt::Debug for ReplayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayState")
            .field("resources", &self.resources)
            .field("options", &self.options)
            .field("frames", &self.frames)
            .field("warnings", &self.warnings)
            .finish()
    }
}

/// Symbolic name of a GL error code
pub fn gl_error_name(error: u32) -> String {
    match error {
        0x0500 => "GL_INVALID_ENUM".to_string(),
        0x0501 => "GL_INVALID_VALUE".to_string(),
        0x0502 => "GL_INVALID_OPERATION".to_string(),
        0x0503 => "GL_STACK_OVERFLOW".to_string(),
        0x0504 => "GL_STACK_UNDERFLOW".to_string(),
        0x0505 => "GL_OUT_OF_MEMORY".to_string(),
        0x0506 => "GL_INVALID_FRAMEBUFFER_OPERATION".to_string(),
        0x8031 => "GL_TABLE_TOO_LARGE".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallFlags, FunctionSig};
    use crate::profiling::ProfilingOptions;
    use crate::ws::HeadlessWindowSystem;
    use std::sync::Arc;

    fn call(name: &str) -> Call {
        Call {
            no: 1,
            thread_id: 0,
            sig: Arc::new(FunctionSig::new(0, name, &[])),
            args: vec![],
            ret: None,
            flags: CallFlags::empty(),
            offset: 0,
        }
    }

    fn state(ws: &HeadlessWindowSystem) -> ReplayState {
        ReplayState::new(Box::new(ws.clone()), StateOptions::default(), None)
    }

    #[test]
    fn test_gl_error_names() {
        assert_eq!(gl_error_name(0x0502), "GL_INVALID_OPERATION");
        assert_eq!(gl_error_name(0x1234), "4660");
    }

    #[test]
    fn test_make_current_marks_context_used() {
        let ws = HeadlessWindowSystem::new();
        let mut st = state(&ws);
        let d = st.create_drawable().unwrap();
        let c = st.create_context(None, None).unwrap();
        st.make_current(&call("glXMakeCurrent"), Some(d), Some(c)).unwrap();
        assert!(st.resources.current_context().unwrap().used);
        assert_eq!(ws.current(), (Some(d), Some(c)));
    }

    #[test]
    fn test_make_current_failure_is_fatal() {
        let ws = HeadlessWindowSystem::new();
        let mut st = state(&ws);
        let c = st.create_context(None, None).unwrap();
        ws.fail_make_current(true);
        assert!(matches!(
            st.make_current(&call("eglMakeCurrent"), None, Some(c)),
            Err(ReplayError::WindowSystem(_))
        ));
    }

    #[test]
    fn test_profiling_requirements_checked_on_first_bind() {
        let ws = HeadlessWindowSystem::with_extensions(&[]);
        let profiler = CallProfiler::with_writer(
            ProfilingOptions {
                pixels: true,
                ..Default::default()
            },
            Box::new(Vec::new()),
        );
        let mut st = ReplayState::new(Box::new(ws.clone()), StateOptions::default(), Some(profiler));
        let d = st.create_drawable().unwrap();
        let c = st.create_context(None, None).unwrap();
        assert!(matches!(
            st.make_current(&call("glXMakeCurrent"), Some(d), Some(c)),
            Err(ReplayError::UnsupportedProfiling(_))
        ));
    }

    #[test]
    fn test_update_drawable_grows_window() {
        let ws = HeadlessWindowSystem::new();
        let mut st = state(&ws);
        let d = st.create_drawable().unwrap();
        let c = st.create_context(None, None).unwrap();
        st.make_current(&call("glXMakeCurrent"), Some(d), Some(c)).unwrap();

        st.update_drawable(640, 480);
        assert_eq!(ws.drawable_size(d), Some((640, 480)));
        assert!(ws.is_visible(d));

        st.update_drawable(320, 240);
        assert_eq!(ws.drawable_size(d), Some((640, 480)));
        st.update_drawable(800, 0);
        assert_eq!(ws.drawable_size(d), Some((640, 480)));
    }

    #[test]
    fn test_frame_complete_warns_on_hidden_drawable() {
        let ws = HeadlessWindowSystem::new();
        let mut st = state(&ws);
        st.options.debug = false;
        st.frame_complete(&call("glXSwapBuffers")).unwrap();
        assert_eq!(st.frames(), 0);
        assert_eq!(st.warnings(), 0);

        let d = st.create_drawable().unwrap();
        let c = st.create_context(None, None).unwrap();
        st.make_current(&call("glXMakeCurrent"), Some(d), Some(c)).unwrap();
        st.options.debug = true;
        st.frame_complete(&call("glXSwapBuffers")).unwrap();
        st.count_frame();
        assert_eq!(st.frames(), 1);
        assert_eq!(st.warnings(), 1);
    }

    #[test]
    fn test_dump_state_requires_context() {
        let ws = HeadlessWindowSystem::new();
        let mut st = state(&ws);
        assert!(st.dump_state().is_none());
        let d = st.create_drawable().unwrap();
        let c = st.create_context(None, None).unwrap();
        st.make_current(&call("glXMakeCurrent"), Some(d), Some(c)).unwrap();
        let dump = st.dump_state().unwrap();
        assert_eq!(dump["live_contexts"], 1);
        assert_eq!(dump["context"]["id"], c.0);
    }

    #[test]
    fn test_wait_for_input_pumps_events() {
        let ws = HeadlessWindowSystem::new();
        ws.keep_open_for(2);
        let mut st = state(&ws);
        st.wait_for_input().unwrap();
        let mut other = ws.clone();
        assert!(!other.process_events());
    }
}
