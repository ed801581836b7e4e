//! Window-system boundary
//!
//! Everything the replay needs from a real graphics stack goes through
//! [`WindowSystem`]: creating and binding contexts and drawables, presenting,
//! executing API calls, GPU queries and reading back the draw buffer.
//!
//! [`HeadlessWindowSystem`] is the null driver used for benchmarking the
//! replay machinery and for tests. It performs no rendering but keeps enough
//! bookkeeping (object tables, an operation log, simulated GPU clock and
//! sample counters) to make replay observable and deterministic.

use crate::call::Call;
use crate::error::Result;
use crate::prefetch::lock;
use crate::snapshot::Image;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Window-system context identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

/// Window-system drawable identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DrawableId(pub u64);

/// Rendering API flavour a context or drawable is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    Compat,
    Es1,
    Es2,
    Desktop { major: u8, minor: u8, core: bool },
}

impl Profile {
    pub const CORE_3_2: Profile = Profile::Desktop {
        major: 3,
        minor: 2,
        core: true,
    };

    /// Profile requested through context attributes
    pub fn from_version(major: u32, minor: u32, core: bool) -> Self {
        if major >= 3 {
            Profile::Desktop {
                major: major.min(u8::MAX as u32) as u8,
                minor: minor.min(u8::MAX as u32) as u8,
                core,
            }
        } else {
            Profile::Compat
        }
    }

    pub fn is_es(&self) -> bool {
        matches!(self, Profile::Es1 | Profile::Es2)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Compat => write!(f, "OpenGL"),
            Profile::Es1 => write!(f, "OpenGL ES 1.1"),
            Profile::Es2 => write!(f, "OpenGL ES 2.0"),
            Profile::Desktop { major, minor, core } => {
                write!(f, "OpenGL {}.{}", major, minor)?;
                if *core {
                    write!(f, " core")?;
                }
                Ok(())
            }
        }
    }
}

/// GPU query kinds used by call profiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Timestamp,
    TimeElapsed,
    SamplesPassed,
}

/// Driver debug-output message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    pub source: String,
    pub kind: String,
    pub severity: Severity,
    pub id: u32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::High => write!(f, "High"),
            Severity::Medium => write!(f, "Medium"),
            Severity::Low => write!(f, "Low"),
        }
    }
}

/// Driver-facing operations needed by replay
pub trait WindowSystem: Send {
    fn create_drawable(&mut self, profile: Profile, pbuffer: Option<(u32, u32)>) -> Result<DrawableId>;

    fn destroy_drawable(&mut self, drawable: DrawableId);

    /// Create a context; `None` when the profile is unavailable
    fn create_context(&mut self, profile: Profile, share: Option<ContextId>) -> Option<ContextId>;

    fn destroy_context(&mut self, context: ContextId);

    /// Bind (or unbind with `None`) a drawable and context on this thread
    fn make_current(&mut self, drawable: Option<DrawableId>, context: Option<ContextId>) -> bool;

    fn resize_drawable(&mut self, drawable: DrawableId, width: u32, height: u32);

    fn show_drawable(&mut self, drawable: DrawableId);

    fn swap_buffers(&mut self, drawable: DrawableId);

    fn copy_sub_buffer(&mut self, drawable: DrawableId, x: i32, y: i32, width: u32, height: u32);

    fn flush(&mut self);

    fn finish(&mut self);

    /// Forward an API call to the driver
    fn execute(&mut self, call: &Call);

    /// Drain pending API error codes
    fn take_errors(&mut self) -> Vec<u32>;

    fn take_debug_messages(&mut self) -> Vec<DebugMessage> {
        Vec::new()
    }

    /// Extension availability on the current context
    fn has_extension(&self, name: &str) -> bool;

    /// Read back the current draw buffer
    fn read_draw_buffer(&mut self) -> Option<Image>;

    /// Pump window events; `true` while the window should stay open
    fn process_events(&mut self) -> bool {
        false
    }

    fn create_query(&mut self, kind: QueryKind) -> Option<u32>;

    fn begin_query(&mut self, query: u32);

    fn end_query(&mut self, query: u32);

    fn query_result(&mut self, query: u32) -> i64;

    fn delete_query(&mut self, query: u32);

    /// Current GPU time in nanoseconds, without stalling
    fn gpu_time(&mut self) -> i64;

    fn query_counter_bits(&self) -> u32 {
        64
    }
}

/// Operations recorded by the headless driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOp {
    CreateDrawable { id: DrawableId, pbuffer: bool },
    DestroyDrawable(DrawableId),
    CreateContext { id: ContextId, profile: Profile, share: Option<ContextId> },
    DestroyContext(ContextId),
    MakeCurrent { drawable: Option<DrawableId>, context: Option<ContextId> },
    Resize { id: DrawableId, width: u32, height: u32 },
    Swap(DrawableId),
    CopySubBuffer(DrawableId),
    Flush,
    Finish,
    Execute(String),
}

#[derive(Debug, Clone)]
struct HeadlessDrawable {
    width: u32,
    height: u32,
    pbuffer: bool,
    visible: bool,
    swaps: u64,
    draws: u64,
}

#[derive(Debug, Clone, Copy)]
struct HeadlessQuery {
    kind: QueryKind,
    start: i64,
    result: i64,
    active: bool,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    contexts: BTreeMap<ContextId, Profile>,
    drawables: BTreeMap<DrawableId, HeadlessDrawable>,
    current: (Option<DrawableId>, Option<ContextId>),
    extensions: BTreeSet<String>,
    unavailable_profiles: HashSet<Profile>,
    injected_errors: HashMap<String, Vec<u32>>,
    injected_messages: HashMap<String, Vec<DebugMessage>>,
    pending_errors: Vec<u32>,
    pending_messages: Vec<DebugMessage>,
    fail_make_current: bool,
    open_events: u32,
    clock_ns: i64,
    samples: i64,
    next_query: u32,
    queries: HashMap<u32, HeadlessQuery>,
    ops: Vec<WsOp>,
}

/// Null driver
///
/// Cloning yields another handle onto the same driver state, so a test can
/// keep one while replay owns the other.
#[derive(Debug, Clone)]
pub struct HeadlessWindowSystem {
    inner: Arc<Mutex<Inner>>,
}

/// Extensions the headless driver reports by default
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "GL_ARB_timer_query",
    "GL_EXT_timer_query",
    "GL_ARB_occlusion_query",
    "GL_ARB_debug_output",
    "GL_ARB_shader_objects",
];

const DEFAULT_SIZE: u32 = 32;
const EXECUTE_NS: i64 = 1_000;
const DRAW_NS: i64 = 5_000;

impl HeadlessWindowSystem {
    pub fn new() -> Self {
        Self::with_extensions(DEFAULT_EXTENSIONS)
    }

    pub fn with_extensions(extensions: &[&str]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                contexts: BTreeMap::new(),
                drawables: BTreeMap::new(),
                current: (None, None),
                extensions: extensions.iter().map(|s| s.to_string()).collect(),
                unavailable_profiles: HashSet::new(),
                injected_errors: HashMap::new(),
                injected_messages: HashMap::new(),
                pending_errors: Vec::new(),
                pending_messages: Vec::new(),
                fail_make_current: false,
                open_events: 0,
                clock_ns: 0,
                samples: 0,
                next_query: 1,
                queries: HashMap::new(),
                ops: Vec::new(),
            })),
        }
    }

    /// Make context creation fail for `profile`
    pub fn disable_profile(&self, profile: Profile) {
        lock(&self.inner).unavailable_profiles.insert(profile);
    }

    /// Raise `error` every time a call named `call_name` executes
    pub fn inject_error(&self, call_name: &str, error: u32) {
        lock(&self.inner)
            .injected_errors
            .entry(call_name.to_string())
            .or_default()
            .push(error);
    }

    /// Emit `message` every time a call named `call_name` executes
    pub fn inject_debug_message(&self, call_name: &str, message: DebugMessage) {
        lock(&self.inner)
            .injected_messages
            .entry(call_name.to_string())
            .or_default()
            .push(message);
    }

    pub fn fail_make_current(&self, fail: bool) {
        lock(&self.inner).fail_make_current = fail;
    }

    /// Keep the window "open" for `n` event pumps
    pub fn keep_open_for(&self, n: u32) {
        lock(&self.inner).open_events = n;
    }

    pub fn ops(&self) -> Vec<WsOp> {
        lock(&self.inner).ops.clone()
    }

    pub fn live_contexts(&self) -> Vec<ContextId> {
        lock(&self.inner).contexts.keys().copied().collect()
    }

    pub fn live_drawables(&self) -> Vec<DrawableId> {
        lock(&self.inner).drawables.keys().copied().collect()
    }

    pub fn current(&self) -> (Option<DrawableId>, Option<ContextId>) {
        lock(&self.inner).current
    }

    pub fn drawable_size(&self, drawable: DrawableId) -> Option<(u32, u32)> {
        lock(&self.inner)
            .drawables
            .get(&drawable)
            .map(|d| (d.width, d.height))
    }

    pub fn is_visible(&self, drawable: DrawableId) -> bool {
        lock(&self.inner)
            .drawables
            .get(&drawable)
            .is_some_and(|d| d.visible)
    }

    pub fn is_pbuffer(&self, drawable: DrawableId) -> bool {
        lock(&self.inner)
            .drawables
            .get(&drawable)
            .is_some_and(|d| d.pbuffer)
    }

    pub fn swap_count(&self) -> u64 {
        lock(&self.inner)
            .ops
            .iter()
            .filter(|op| matches!(op, WsOp::Swap(_)))
            .count() as u64
    }

    fn alloc_id(inner: &mut Inner) -> u64 {
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }
}

impl Default for HeadlessWindowSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowSystem for HeadlessWindowSystem {
    fn create_drawable(&mut self, _profile: Profile, pbuffer: Option<(u32, u32)>) -> Result<DrawableId> {
        let mut inner = lock(&self.inner);
        let id = DrawableId(Self::alloc_id(&mut inner));
        let (width, height) = pbuffer.unwrap_or((DEFAULT_SIZE, DEFAULT_SIZE));
        inner.drawables.insert(
            id,
            HeadlessDrawable {
                width,
                height,
                pbuffer: pbuffer.is_some(),
                visible: pbuffer.is_some(),
                swaps: 0,
                draws: 0,
            },
        );
        inner.ops.push(WsOp::CreateDrawable {
            id,
            pbuffer: pbuffer.is_some(),
        });
        Ok(id)
    }

    fn destroy_drawable(&mut self, drawable: DrawableId) {
        let mut inner = lock(&self.inner);
        if inner.drawables.remove(&drawable).is_some() {
            inner.ops.push(WsOp::DestroyDrawable(drawable));
        }
    }

    fn create_context(&mut self, profile: Profile, share: Option<ContextId>) -> Option<ContextId> {
        let mut inner = lock(&self.inner);
        if inner.unavailable_profiles.contains(&profile) {
            return None;
        }
        let id = ContextId(Self::alloc_id(&mut inner));
        inner.contexts.insert(id, profile);
        inner.ops.push(WsOp::CreateContext { id, profile, share });
        Some(id)
    }

    fn destroy_context(&mut self, context: ContextId) {
        let mut inner = lock(&self.inner);
        if inner.contexts.remove(&context).is_some() {
            inner.ops.push(WsOp::DestroyContext(context));
        }
    }

    fn make_current(&mut self, drawable: Option<DrawableId>, context: Option<ContextId>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.fail_make_current {
            return false;
        }
        if drawable.is_some_and(|d| !inner.drawables.contains_key(&d))
            || context.is_some_and(|c| !inner.contexts.contains_key(&c))
        {
            return false;
        }
        inner.current = (drawable, context);
        inner.ops.push(WsOp::MakeCurrent { drawable, context });
        true
    }

    fn resize_drawable(&mut self, drawable: DrawableId, width: u32, height: u32) {
        let mut inner = lock(&self.inner);
        if let Some(d) = inner.drawables.get_mut(&drawable) {
            d.width = width;
            d.height = height;
            inner.ops.push(WsOp::Resize {
                id: drawable,
                width,
                height,
            });
        }
    }

    fn show_drawable(&mut self, drawable: DrawableId) {
        if let Some(d) = lock(&self.inner).drawables.get_mut(&drawable) {
            d.visible = true;
        }
    }

    fn swap_buffers(&mut self, drawable: DrawableId) {
        let mut inner = lock(&self.inner);
        if let Some(d) = inner.drawables.get_mut(&drawable) {
            d.swaps += 1;
            inner.ops.push(WsOp::Swap(drawable));
        }
    }

    fn copy_sub_buffer(&mut self, drawable: DrawableId, _x: i32, _y: i32, _width: u32, _height: u32) {
        lock(&self.inner).ops.push(WsOp::CopySubBuffer(drawable));
    }

    fn flush(&mut self) {
        lock(&self.inner).ops.push(WsOp::Flush);
    }

    fn finish(&mut self) {
        lock(&self.inner).ops.push(WsOp::Finish);
    }

    fn execute(&mut self, call: &Call) {
        let mut inner = lock(&self.inner);
        let inner = &mut *inner;
        inner.clock_ns += EXECUTE_NS;
        if call.is_draw() {
            inner.clock_ns += DRAW_NS;
            if let Some(d) = inner.current.0.and_then(|id| inner.drawables.get_mut(&id)) {
                d.draws += 1;
                inner.samples += d.width as i64 * d.height as i64;
            }
        }
        if let Some(errors) = inner.injected_errors.get(call.name()) {
            inner.pending_errors.extend(errors.iter().copied());
        }
        if let Some(messages) = inner.injected_messages.get(call.name()) {
            inner.pending_messages.extend(messages.iter().cloned());
        }
        inner.ops.push(WsOp::Execute(call.name().to_string()));
    }

    fn take_errors(&mut self) -> Vec<u32> {
        std::mem::take(&mut lock(&self.inner).pending_errors)
    }

    fn take_debug_messages(&mut self) -> Vec<DebugMessage> {
        std::mem::take(&mut lock(&self.inner).pending_messages)
    }

    fn has_extension(&self, name: &str) -> bool {
        let inner = lock(&self.inner);
        inner.current.1.is_some() && inner.extensions.contains(name)
    }

    fn read_draw_buffer(&mut self) -> Option<Image> {
        let inner = lock(&self.inner);
        let context = inner.current.1?;
        let drawable = inner.drawables.get(&inner.current.0?)?;
        let (width, height) = (drawable.width, drawable.height);
        let mut pixels = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(drawable.swaps.wrapping_mul(16).wrapping_add(x as u64) as u8);
                pixels.push(drawable.draws.wrapping_mul(8).wrapping_add(y as u64) as u8);
                pixels.push(context.0.wrapping_mul(32) as u8);
                pixels.push(0xff);
            }
        }
        Some(Image::new(width, height, 4, pixels))
    }

    fn process_events(&mut self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.open_events == 0 {
            return false;
        }
        inner.open_events -= 1;
        true
    }

    fn create_query(&mut self, kind: QueryKind) -> Option<u32> {
        let mut inner = lock(&self.inner);
        inner.current.1?;
        let id = inner.next_query;
        inner.next_query += 1;
        inner.queries.insert(
            id,
            HeadlessQuery {
                kind,
                start: 0,
                result: 0,
                active: false,
            },
        );
        Some(id)
    }

    fn begin_query(&mut self, query: u32) {
        let mut inner = lock(&self.inner);
        let (clock, samples) = (inner.clock_ns, inner.samples);
        if let Some(q) = inner.queries.get_mut(&query) {
            match q.kind {
                QueryKind::Timestamp => q.result = clock,
                QueryKind::TimeElapsed => q.start = clock,
                QueryKind::SamplesPassed => q.start = samples,
            }
            q.active = true;
        }
    }

    fn end_query(&mut self, query: u32) {
        let mut inner = lock(&self.inner);
        let (clock, samples) = (inner.clock_ns, inner.samples);
        if let Some(q) = inner.queries.get_mut(&query) {
            if !q.active {
                return;
            }
            match q.kind {
                QueryKind::Timestamp => {}
                QueryKind::TimeElapsed => q.result = clock - q.start,
                QueryKind::SamplesPassed => q.result = samples - q.start,
            }
            q.active = false;
        }
    }

    fn query_result(&mut self, query: u32) -> i64 {
        lock(&self.inner)
            .queries
            .get(&query)
            .map(|q| q.result)
            .unwrap_or(0)
    }

    fn delete_query(&mut self, query: u32) {
        lock(&self.inner).queries.remove(&query);
    }

    fn gpu_time(&mut self) -> i64 {
        lock(&self.inner).clock_ns
    }
}
