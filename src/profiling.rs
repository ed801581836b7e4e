//! Per-call profiling
//!
//! Brackets replayed calls with CPU timestamps, process memory samples and,
//! for draw calls, GPU timer and occlusion queries. Queries are resolved in
//! bulk when rendering is flushed (context switch, relay hand-off, frame end)
//! so reading results never stalls the pipeline mid-frame.
//!
//! Output is one line per call, preceded by a header on first use:
//!
//! ```text
//! # call no gpu_start gpu_dura cpu_start cpu_dura vsize_start vsize_dura rss_start rss_dura pixels program name
//! call 12 0 0 1830 2210 0 0 0 0 -1 0 glClear
//! frame_end
//! ```

use crate::call::Call;
use crate::error::{ReplayError, Result};
use crate::ws::{QueryKind, WindowSystem};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Instant;

/// Which measurements to take
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingOptions {
    pub cpu: bool,
    pub gpu: bool,
    pub pixels: bool,
    pub memory: bool,
}

impl ProfilingOptions {
    pub fn any(&self) -> bool {
        self.cpu || self.gpu || self.pixels || self.memory
    }
}

/// Completed measurement of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileRow {
    pub call_no: u64,
    pub gpu_start: i64,
    pub gpu_duration: i64,
    pub cpu_start: i64,
    pub cpu_duration: i64,
    pub vsize_start: i64,
    pub vsize_duration: i64,
    pub rss_start: i64,
    pub rss_duration: i64,
    /// Samples passed, or -1 for non-draw calls
    pub pixels: i64,
    pub program: u32,
}

#[derive(Debug)]
struct CallQuery {
    call_no: u64,
    name: String,
    is_draw: bool,
    program: u32,
    gpu_start: Option<u32>,
    gpu_duration: Option<u32>,
    occlusion: Option<u32>,
    cpu_start: i64,
    cpu_end: i64,
    vsize_start: i64,
    vsize_end: i64,
    rss_start: i64,
    rss_end: i64,
}

/// Extension support found on the first bound context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySupport {
    pub timestamp: bool,
    pub elapsed: bool,
    pub occlusion: bool,
}

impl Default for QuerySupport {
    fn default() -> Self {
        Self {
            timestamp: true,
            elapsed: true,
            occlusion: true,
        }
    }
}

pub struct CallProfiler {
    options: ProfilingOptions,
    support: QuerySupport,
    queries: Vec<CallQuery>,
    epoch: Instant,
    out: Box<dyn Write + Send>,
    header_written: bool,
    rows: u64,
}

impl CallProfiler {
    pub fn new(options: ProfilingOptions) -> Self {
        Self::with_writer(options, Box::new(std::io::stdout()))
    }

    pub fn with_writer(options: ProfilingOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            options,
            support: QuerySupport::default(),
            queries: Vec::new(),
            epoch: Instant::now(),
            out,
            header_written: false,
            rows: 0,
        }
    }

    pub fn options(&self) -> ProfilingOptions {
        self.options
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Probe the newly bound context for the queries profiling needs
    ///
    /// Missing support for a requested measurement is fatal.
    pub fn check_support(&mut self, ws: &dyn WindowSystem) -> Result<()> {
        let timestamp = ws.has_extension("GL_ARB_timer_query");
        self.support = QuerySupport {
            timestamp,
            elapsed: timestamp || ws.has_extension("GL_EXT_timer_query"),
            occlusion: ws.has_extension("GL_ARB_occlusion_query"),
        };

        if self.options.gpu {
            if !self.support.timestamp && !self.support.elapsed {
                return Err(ReplayError::UnsupportedProfiling(
                    "GL_EXT_timer_query extension".to_string(),
                ));
            }
            if ws.query_counter_bits() == 0 {
                return Err(ReplayError::UnsupportedProfiling(
                    "GL_QUERY_COUNTER_BITS == 0".to_string(),
                ));
            }
        }
        if self.options.pixels && !self.support.occlusion {
            return Err(ReplayError::UnsupportedProfiling(
                "GL_ARB_occlusion_query extension".to_string(),
            ));
        }
        Ok(())
    }

    fn cpu_now(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    pub fn begin(&mut self, ws: &mut dyn WindowSystem, call: &Call, is_draw: bool, program: u32) {
        let mut query = CallQuery {
            call_no: call.no,
            name: call.name().to_string(),
            is_draw,
            program,
            gpu_start: None,
            gpu_duration: None,
            occlusion: None,
            cpu_start: 0,
            cpu_end: 0,
            vsize_start: 0,
            vsize_end: 0,
            rss_start: 0,
            rss_end: 0,
        };

        if is_draw {
            if self.options.gpu {
                if self.support.timestamp {
                    query.gpu_start = ws.create_query(QueryKind::Timestamp);
                    if let Some(id) = query.gpu_start {
                        ws.begin_query(id);
                    }
                }
                query.gpu_duration = ws.create_query(QueryKind::TimeElapsed);
                if let Some(id) = query.gpu_duration {
                    ws.begin_query(id);
                }
            }
            if self.options.pixels {
                query.occlusion = ws.create_query(QueryKind::SamplesPassed);
                if let Some(id) = query.occlusion {
                    ws.begin_query(id);
                }
            }
        }

        if self.options.cpu {
            query.cpu_start = self.cpu_now();
        }
        if self.options.memory {
            let (vsize, rss) = process_memory();
            query.vsize_start = vsize;
            query.rss_start = rss;
        }
        self.queries.push(query);
    }

    pub fn end(&mut self, ws: &mut dyn WindowSystem) {
        let cpu_now = if self.options.cpu { self.cpu_now() } else { 0 };
        let memory = self.options.memory.then(process_memory);
        let Some(query) = self.queries.last_mut() else {
            return;
        };

        query.cpu_end = cpu_now;
        if query.is_draw {
            if let Some(id) = query.gpu_duration {
                ws.end_query(id);
            }
            if let Some(id) = query.occlusion {
                ws.end_query(id);
            }
        }
        if let Some((vsize, rss)) = memory {
            query.vsize_end = vsize;
            query.rss_end = rss;
        }
    }

    /// Resolve all outstanding queries and write their rows
    pub fn flush(&mut self, ws: &mut dyn WindowSystem) -> Result<()> {
        let queries = std::mem::take(&mut self.queries);
        for query in queries {
            let row = self.complete(ws, &query);
            self.write_row(&row, &query.name)?;
        }
        Ok(())
    }

    /// Flush and mark the end of a frame
    pub fn frame_end(&mut self, ws: &mut dyn WindowSystem) -> Result<()> {
        self.flush(ws)?;
        self.write_header()?;
        writeln!(self.out, "frame_end")?;
        Ok(())
    }

    fn complete(&self, ws: &mut dyn WindowSystem, query: &CallQuery) -> ProfileRow {
        let mut row = ProfileRow {
            call_no: query.call_no,
            program: query.program,
            pixels: -1,
            ..Default::default()
        };

        if query.is_draw {
            if let Some(id) = query.gpu_start {
                row.gpu_start = ws.query_result(id);
            }
            if let Some(id) = query.gpu_duration {
                row.gpu_duration = ws.query_result(id);
            }
            row.pixels = query.occlusion.map(|id| ws.query_result(id)).unwrap_or(0);
        }
        if self.options.cpu {
            row.cpu_start = query.cpu_start;
            row.cpu_duration = query.cpu_end - query.cpu_start;
        }
        if self.options.memory {
            row.vsize_start = query.vsize_start;
            row.vsize_duration = query.vsize_end - query.vsize_start;
            row.rss_start = query.rss_start;
            row.rss_duration = query.rss_end - query.rss_start;
        }

        for id in [query.gpu_start, query.gpu_duration, query.occlusion]
            .into_iter()
            .flatten()
        {
            ws.delete_query(id);
        }
        row
    }

    fn write_header(&mut self) -> Result<()> {
        if !self.header_written {
            writeln!(
                self.out,
                "# call no gpu_start gpu_dura cpu_start cpu_dura vsize_start vsize_dura rss_start rss_dura pixels program name"
            )?;
            self.header_written = true;
        }
        Ok(())
    }

    fn write_row(&mut self, row: &ProfileRow, name: &str) -> Result<()> {
        self.write_header()?;
        writeln!(
            self.out,
            "call {} {} {} {} {} {} {} {} {} {} {} {}",
            row.call_no,
            row.gpu_start,
            row.gpu_duration,
            row.cpu_start,
            row.cpu_duration,
            row.vsize_start,
            row.vsize_duration,
            row.rss_start,
            row.rss_duration,
            row.pixels,
            row.program,
            name
        )?;
        self.rows += 1;
        Ok(())
    }
}

impl std::fmt::Debug for CallProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallProfiler")
            .field("options", &self.options)
            .field("support", &self.support)
            .field("pending", &self.queries.len())
            .field("rows", &self.rows)
            .finish()
    }
}

/// Virtual and resident set size of this process, in bytes
#[cfg(target_os = "linux")]
pub fn process_memory() -> (i64, i64) {
    use nix::unistd::{sysconf, SysconfVar};

    let page_size = match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) => size as i64,
        _ => 4096,
    };
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return (0, 0);
    };
    let mut fields = statm.split_whitespace().map(|f| f.parse::<i64>().unwrap_or(0));
    let vsize = fields.next().unwrap_or(0);
    let rss = fields.next().unwrap_or(0);
    (vsize * page_size, rss * page_size)
}

#[cfg(not(target_os = "linux"))]
pub fn process_memory() -> (i64, i64) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallFlags, FunctionSig};
    use crate::ws::{HeadlessWindowSystem, Profile};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Shared {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn call(no: u64, name: &str, flags: CallFlags) -> Call {
        Call {
            no,
            thread_id: 0,
            sig: Arc::new(FunctionSig::new(0, name, &[])),
            args: vec![],
            ret: None,
            flags,
            offset: 0,
        }
    }

    fn bound_ws(extensions: &[&str]) -> HeadlessWindowSystem {
        let mut ws = HeadlessWindowSystem::with_extensions(extensions);
        let d = ws.create_drawable(Profile::Compat, None).unwrap();
        let c = ws.create_context(Profile::Compat, None).unwrap();
        ws.make_current(Some(d), Some(c));
        ws
    }

    #[test]
    fn test_missing_timer_query_is_fatal() {
        let ws = bound_ws(&[]);
        let mut profiler = CallProfiler::with_writer(
            ProfilingOptions {
                gpu: true,
                ..Default::default()
            },
            Box::new(Vec::new()),
        );
        let err = profiler.check_support(&ws).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot run profile, GL_EXT_timer_query extension is not supported"
        );
    }

    #[test]
    fn test_missing_occlusion_query_is_fatal() {
        let ws = bound_ws(&["GL_ARB_timer_query"]);
        let mut profiler = CallProfiler::with_writer(
            ProfilingOptions {
                pixels: true,
                ..Default::default()
            },
            Box::new(Vec::new()),
        );
        assert!(matches!(
            profiler.check_support(&ws),
            Err(ReplayError::UnsupportedProfiling(_))
        ));
    }

    #[test]
    fn test_rows_written_on_flush() {
        let mut ws = bound_ws(crate::ws::DEFAULT_EXTENSIONS);
        let out = Shared::default();
        let mut profiler = CallProfiler::with_writer(
            ProfilingOptions {
                cpu: true,
                gpu: true,
                pixels: true,
                memory: false,
            },
            Box::new(out.clone()),
        );
        profiler.check_support(&ws).unwrap();

        let clear = call(3, "glClear", CallFlags::RENDER);
        profiler.begin(&mut ws, &clear, true, 7);
        ws.execute(&clear);
        profiler.end(&mut ws);

        let enable = call(4, "glEnable", CallFlags::empty());
        profiler.begin(&mut ws, &enable, false, 7);
        ws.execute(&enable);
        profiler.end(&mut ws);

        assert!(out.text().is_empty());
        profiler.frame_end(&mut ws).unwrap();

        let text = out.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("# call no gpu_start"));

        let draw: Vec<&str> = lines[1].split(' ').collect();
        assert_eq!(draw[0], "call");
        assert_eq!(draw[1], "3");
        assert_eq!(draw[3], "6000");
        assert_eq!(draw[10], "1024");
        assert_eq!(draw[11], "7");
        assert_eq!(draw[12], "glClear");

        let state: Vec<&str> = lines[2].split(' ').collect();
        assert_eq!(state[10], "-1");
        assert_eq!(lines[3], "frame_end");
        assert_eq!(profiler.rows_written(), 2);
    }

    #[test]
    fn test_memory_sampling() {
        let (vsize, rss) = process_memory();
        if cfg!(target_os = "linux") {
            assert!(vsize > 0);
            assert!(rss > 0);
        }
    }
}
